//! Directory wire codec.
//!
//! Every exchange with the key directory starts with a 3-byte header:
//!
//! ```text
//! protocol version <1> || message type <1> || curve id <1>
//! ```
//!
//! Message bodies (big-endian integers throughout):
//!
//! - `registerUser`:  `Ik`
//! - `deleteUser`:    empty (the server identifies the caller from the
//!   `From` header)
//! - `postSPk`:       `SPk || SPk_sig || spk_id<4>`
//! - `postOPks`:      `count<2> || (OPk || opk_id<4>) * count`
//! - `getPeerBundle`: `count<2> || (len<2> || device_id) * count`
//! - `peerBundle`:    `count<2> || entry * count` where an entry is
//!   `len<2> || device_id || have_opk<1> || Ik || SPk || spk_id<4> ||
//!   SPk_sig || (OPk || opk_id<4>)?`
//! - `error`:         `code<1> || utf8 message?`
//!
//! A success response echoes the request's message type with an empty
//! body, except `getPeerBundle`, which is answered by `peerBundle`.
//!
//! Parsing is strict: every length is checked before the read, a failed
//! parse yields no partial output, and trailing bytes are rejected. A
//! header carrying the wrong version or curve fails the exchange before
//! any body is inspected.
//!
//! The X3DH-init prefix carried by the first ratchet message of a new
//! session is framed here as well:
//!
//! ```text
//! have_opk<1> || Ik || Ek || spk_id<4> || (opk_id<4>)?
//! ```

use crate::curve::{CurveId, CurveSuite};
use crate::error::{Error, Result};
use crate::keys::{DhPublicKey, SignaturePublicKey};
use crate::x3dh::PeerBundle;
use tracing::warn;

/// Directory protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Length of the fixed message header
pub const HEADER_LEN: usize = 3;

/// Directory message type, second byte of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Publish the identity key of a new user
    RegisterUser = 0x01,
    /// Remove the calling user from the directory
    DeleteUser = 0x02,
    /// Publish a signed prekey
    PostSpk = 0x03,
    /// Publish a batch of one-time prekeys
    PostOpks = 0x04,
    /// Request key bundles for a list of peer devices
    GetPeerBundle = 0x05,
    /// Server response carrying peer key bundles
    PeerBundle = 0x06,
    /// Server error response
    Error = 0xFF,
}

impl MessageType {
    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(MessageType::RegisterUser),
            0x02 => Ok(MessageType::DeleteUser),
            0x03 => Ok(MessageType::PostSpk),
            0x04 => Ok(MessageType::PostOpks),
            0x05 => Ok(MessageType::GetPeerBundle),
            0x06 => Ok(MessageType::PeerBundle),
            0xFF => Ok(MessageType::Error),
            _ => Err(Error::ProtocolViolation("unknown message type")),
        }
    }
}

/// Error codes carried by a directory `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Request had the wrong content type
    BadContentType = 0x00,
    /// Server runs a different curve
    BadCurve = 0x01,
    /// Request lacked the `From` header
    MissingSenderId = 0x02,
    /// Server runs a different protocol version
    BadProtocolVersion = 0x03,
    /// Body size inconsistent with the message type
    BadSize = 0x04,
    /// registerUser for an already-registered device
    UserAlreadyIn = 0x05,
    /// Referenced user is not registered
    UserNotFound = 0x06,
    /// Server-side database failure
    DbError = 0x07,
    /// Malformed request
    BadRequest = 0x08,
}

impl ErrorCode {
    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(ErrorCode::BadContentType),
            0x01 => Ok(ErrorCode::BadCurve),
            0x02 => Ok(ErrorCode::MissingSenderId),
            0x03 => Ok(ErrorCode::BadProtocolVersion),
            0x04 => Ok(ErrorCode::BadSize),
            0x05 => Ok(ErrorCode::UserAlreadyIn),
            0x06 => Ok(ErrorCode::UserNotFound),
            0x07 => Ok(ErrorCode::DbError),
            0x08 => Ok(ErrorCode::BadRequest),
            _ => Err(Error::ProtocolViolation("unknown error code")),
        }
    }
}

/// Strict cursor over a message body. Every read is bounds-checked; the
/// caller finishes with [`Reader::expect_end`] so trailing bytes fail too.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(Error::ProtocolViolation("short read"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn expect_end(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(Error::ProtocolViolation("trailing bytes"))
        }
    }
}

fn make_header<C: CurveSuite>(message_type: MessageType) -> Vec<u8> {
    vec![PROTOCOL_VERSION, message_type as u8, C::ID as u8]
}

fn body_after_header(body: &[u8]) -> Result<&[u8]> {
    body.get(HEADER_LEN..)
        .ok_or(Error::ProtocolViolation("message shorter than header"))
}

// ── builders, client side ────────────────────────────────────────────────

/// `registerUser` request carrying the new identity key.
#[must_use]
pub fn build_register_user<C: CurveSuite>(ik: &SignaturePublicKey<C>) -> Vec<u8> {
    let mut message = make_header::<C>(MessageType::RegisterUser);
    message.extend_from_slice(ik.as_bytes());
    message
}

/// `deleteUser` request. The body is empty; the server resolves the user
/// from the authenticated `From` header.
#[must_use]
pub fn build_delete_user<C: CurveSuite>() -> Vec<u8> {
    make_header::<C>(MessageType::DeleteUser)
}

/// `postSPk` request publishing a signed prekey.
#[must_use]
pub fn build_post_spk<C: CurveSuite>(
    spk: &DhPublicKey<C>,
    spk_sig: &[u8],
    spk_id: u32,
) -> Vec<u8> {
    let mut message = make_header::<C>(MessageType::PostSpk);
    message.extend_from_slice(spk.as_bytes());
    message.extend_from_slice(spk_sig);
    message.extend_from_slice(&spk_id.to_be_bytes());
    message
}

/// `postOPks` request publishing a batch of one-time prekeys.
#[must_use]
pub fn build_post_opks<C: CurveSuite>(opks: &[(u32, DhPublicKey<C>)]) -> Vec<u8> {
    let mut message = make_header::<C>(MessageType::PostOpks);
    message.extend_from_slice(&(opks.len() as u16).to_be_bytes());
    for (opk_id, opk) in opks {
        message.extend_from_slice(opk.as_bytes());
        message.extend_from_slice(&opk_id.to_be_bytes());
    }
    message
}

/// `getPeerBundle` request for a list of peer device ids.
///
/// The count field is 16 bits wide; a larger request is truncated with a
/// warning rather than rejected.
#[must_use]
pub fn build_get_peer_bundles<C: CurveSuite>(device_ids: &mut Vec<String>) -> Vec<u8> {
    if device_ids.len() > usize::from(u16::MAX) {
        warn!(
            requested = device_ids.len(),
            "bundle request exceeds the 16-bit count field, truncating"
        );
        device_ids.truncate(usize::from(u16::MAX));
    }

    let mut message = make_header::<C>(MessageType::GetPeerBundle);
    message.extend_from_slice(&(device_ids.len() as u16).to_be_bytes());
    for device_id in device_ids.iter() {
        message.extend_from_slice(&(device_id.len() as u16).to_be_bytes());
        message.extend_from_slice(device_id.as_bytes());
    }
    message
}

// ── builders, server side ────────────────────────────────────────────────

/// Header-only success response echoing `message_type`.
#[must_use]
pub fn build_ack<C: CurveSuite>(message_type: MessageType) -> Vec<u8> {
    make_header::<C>(message_type)
}

/// `peerBundle` response.
#[must_use]
pub fn build_peer_bundles<C: CurveSuite>(bundles: &[PeerBundle<C>]) -> Vec<u8> {
    let mut message = make_header::<C>(MessageType::PeerBundle);
    message.extend_from_slice(&(bundles.len() as u16).to_be_bytes());
    for bundle in bundles {
        message.extend_from_slice(&(bundle.device_id.len() as u16).to_be_bytes());
        message.extend_from_slice(bundle.device_id.as_bytes());
        message.push(u8::from(bundle.opk.is_some()));
        message.extend_from_slice(bundle.ik.as_bytes());
        message.extend_from_slice(bundle.spk.as_bytes());
        message.extend_from_slice(&bundle.spk_id.to_be_bytes());
        message.extend_from_slice(&bundle.spk_sig);
        if let Some((opk, opk_id)) = &bundle.opk {
            message.extend_from_slice(opk.as_bytes());
            message.extend_from_slice(&opk_id.to_be_bytes());
        }
    }
    message
}

/// `error` response.
#[must_use]
pub fn build_error<C: CurveSuite>(code: ErrorCode, text: &str) -> Vec<u8> {
    let mut message = make_header::<C>(MessageType::Error);
    message.push(code as u8);
    message.extend_from_slice(text.as_bytes());
    message
}

// ── parsers ──────────────────────────────────────────────────────────────

/// Validate the 3-byte header and return the message type.
///
/// Version and curve are checked before the type, so a mismatched
/// exchange fails without any body being inspected.
pub fn parse_header<C: CurveSuite>(body: &[u8]) -> Result<MessageType> {
    if body.len() < HEADER_LEN {
        return Err(Error::ProtocolViolation("message shorter than header"));
    }
    if body[0] != PROTOCOL_VERSION {
        return Err(Error::ProtocolViolation("protocol version mismatch"));
    }
    if CurveId::from_u8(body[2])? != C::ID {
        return Err(Error::ProtocolViolation("curve id mismatch"));
    }
    MessageType::from_u8(body[1])
}

/// Parse an `error` body into its code and optional diagnostic text.
pub fn parse_error<C: CurveSuite>(body: &[u8]) -> Result<(ErrorCode, Option<String>)> {
    let mut reader = Reader::new(body_after_header(body)?);
    let code = ErrorCode::from_u8(reader.read_u8()?)?;
    let text = if reader.remaining() > 0 {
        let bytes = reader.take(reader.remaining())?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    } else {
        None
    };
    Ok((code, text))
}

/// Parse a `registerUser` body.
pub fn parse_register_user<C: CurveSuite>(body: &[u8]) -> Result<SignaturePublicKey<C>> {
    let mut reader = Reader::new(body_after_header(body)?);
    let ik = SignaturePublicKey::from_bytes(reader.take(C::DSA_PUBLIC_LEN)?)?;
    reader.expect_end()?;
    Ok(ik)
}

/// Parse a `postSPk` body into `(SPk, signature, spk_id)`.
pub fn parse_post_spk<C: CurveSuite>(body: &[u8]) -> Result<(DhPublicKey<C>, Vec<u8>, u32)> {
    let mut reader = Reader::new(body_after_header(body)?);
    let spk = DhPublicKey::from_bytes(reader.take(C::X_PUBLIC_LEN)?)?;
    let sig = reader.take(C::SIGNATURE_LEN)?.to_vec();
    let spk_id = reader.read_u32()?;
    reader.expect_end()?;
    Ok((spk, sig, spk_id))
}

/// Parse a `postOPks` body.
pub fn parse_post_opks<C: CurveSuite>(body: &[u8]) -> Result<Vec<(u32, DhPublicKey<C>)>> {
    let mut reader = Reader::new(body_after_header(body)?);
    let count = reader.read_u16()?;
    let mut opks = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let opk = DhPublicKey::from_bytes(reader.take(C::X_PUBLIC_LEN)?)?;
        let opk_id = reader.read_u32()?;
        opks.push((opk_id, opk));
    }
    reader.expect_end()?;
    Ok(opks)
}

/// Parse a `getPeerBundle` body into the requested device ids.
pub fn parse_get_peer_bundles<C: CurveSuite>(body: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::new(body_after_header(body)?);
    let count = reader.read_u16()?;
    let mut device_ids = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = reader.read_u16()?;
        let bytes = reader.take(usize::from(len))?;
        let device_id = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::ProtocolViolation("device id is not utf-8"))?;
        device_ids.push(device_id);
    }
    reader.expect_end()?;
    Ok(device_ids)
}

/// Parse a `peerBundle` body into the carried bundles.
pub fn parse_peer_bundles<C: CurveSuite>(body: &[u8]) -> Result<Vec<PeerBundle<C>>> {
    let mut reader = Reader::new(body_after_header(body)?);
    let count = reader.read_u16()?;
    let mut bundles = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = reader.read_u16()?;
        let device_id = String::from_utf8(reader.take(usize::from(len))?.to_vec())
            .map_err(|_| Error::ProtocolViolation("device id is not utf-8"))?;
        let have_opk = reader.read_u8()? != 0;
        let ik = SignaturePublicKey::from_bytes(reader.take(C::DSA_PUBLIC_LEN)?)?;
        let spk = DhPublicKey::from_bytes(reader.take(C::X_PUBLIC_LEN)?)?;
        let spk_id = reader.read_u32()?;
        let spk_sig = reader.take(C::SIGNATURE_LEN)?.to_vec();
        let opk = if have_opk {
            let opk = DhPublicKey::from_bytes(reader.take(C::X_PUBLIC_LEN)?)?;
            let opk_id = reader.read_u32()?;
            Some((opk, opk_id))
        } else {
            None
        };
        bundles.push(PeerBundle {
            device_id,
            ik,
            spk,
            spk_id,
            spk_sig,
            opk,
        });
    }
    reader.expect_end()?;
    Ok(bundles)
}

// ── X3DH-init prefix ─────────────────────────────────────────────────────

/// Header prepended to the first ratchet message from the initiator,
/// carrying everything the responder needs to rebuild the session key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct X3dhInit<C: CurveSuite> {
    /// Initiator identity key
    pub ik: SignaturePublicKey<C>,
    /// Initiator ephemeral key
    pub ek: DhPublicKey<C>,
    /// Signed prekey the initiator used from the bundle
    pub spk_id: u32,
    /// One-time prekey consumed from the bundle, if the bundle carried one
    pub opk_id: Option<u32>,
}

impl<C: CurveSuite> X3dhInit<C> {
    /// Encoded length given the `have_opk` flag.
    #[must_use]
    pub fn encoded_len(have_opk: bool) -> usize {
        1 + C::DSA_PUBLIC_LEN + C::X_PUBLIC_LEN + 4 + if have_opk { 4 } else { 0 }
    }

    /// Serialize the prefix.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::encoded_len(self.opk_id.is_some()));
        bytes.push(u8::from(self.opk_id.is_some()));
        bytes.extend_from_slice(self.ik.as_bytes());
        bytes.extend_from_slice(self.ek.as_bytes());
        bytes.extend_from_slice(&self.spk_id.to_be_bytes());
        if let Some(opk_id) = self.opk_id {
            bytes.extend_from_slice(&opk_id.to_be_bytes());
        }
        bytes
    }

    /// Parse a prefix from the front of `bytes`; returns the header and
    /// the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut reader = Reader::new(bytes);
        let have_opk = reader.read_u8()? != 0;
        let ik = SignaturePublicKey::from_bytes(reader.take(C::DSA_PUBLIC_LEN)?)?;
        let ek = DhPublicKey::from_bytes(reader.take(C::X_PUBLIC_LEN)?)?;
        let spk_id = reader.read_u32()?;
        let opk_id = if have_opk {
            Some(reader.read_u32()?)
        } else {
            None
        };
        Ok((
            Self {
                ik,
                ek,
                spk_id,
                opk_id,
            },
            reader.pos,
        ))
    }
}
