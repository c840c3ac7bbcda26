//! Double Ratchet session.
//!
//! Combines the DH ratchet (fresh key agreement whenever the peer shows a
//! new ratchet key) with symmetric message chains, giving forward secrecy
//! and post-compromise security per message.
//!
//! A session created by the X3DH initiator carries the X3DH-init header
//! on every outgoing message until the peer has answered once; a session
//! created by the responder uses the signed prekey from the handshake as
//! its first ratchet key, which is what makes the initiator's very first
//! DH ratchet step line up.
//!
//! Decryption is transactional: the ratchet state only advances when the
//! authentication tag verifies, so a dispatcher may try the same message
//! against several candidate sessions without corrupting any of them.

use crate::crypto::{
    aead_open, aead_seal, kdf_chain, kdf_root, SymmetricKey, NONCE_LEN,
};
use crate::curve::CurveSuite;
use crate::error::{Error, Result};
use crate::keys::{DhKeyPair, DhPublicKey};
use crate::protocol::X3dhInit;
use crate::x3dh::{InitiatorSession, SharedAd};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Version byte leading every ratchet message envelope
const MESSAGE_VERSION: u8 = 0x01;

/// Flag bit: the envelope starts with an X3DH-init prefix
const FLAG_X3DH_INIT: u8 = 0b0000_0001;

/// Per-message ratchet header, authenticated alongside the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct RatchetHeader<C: CurveSuite> {
    /// Sender's current ratchet public key
    pub dh_public: DhPublicKey<C>,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Message number within the current sending chain
    pub message_number: u32,
}

impl<C: CurveSuite> RatchetHeader<C> {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(C::X_PUBLIC_LEN + 8);
        bytes.extend_from_slice(self.dh_public.as_bytes());
        bytes.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes.extend_from_slice(&self.message_number.to_be_bytes());
        bytes
    }
}

/// Ratchet message envelope as transmitted.
#[derive(Debug, Clone)]
pub struct RatchetMessage<C: CurveSuite> {
    /// X3DH-init prefix, present until the initiator has seen a reply
    pub init: Option<X3dhInit<C>>,
    /// Ratchet header
    pub header: RatchetHeader<C>,
    /// Sealed payload
    pub ciphertext: Vec<u8>,
}

impl<C: CurveSuite> RatchetMessage<C> {
    /// Serialize the envelope:
    /// `version<1> || flags<1> || (init)? || dh || prev<4> || num<4> || ciphertext`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            2 + self.ciphertext.len() + C::X_PUBLIC_LEN + 8,
        );
        bytes.push(MESSAGE_VERSION);
        bytes.push(if self.init.is_some() {
            FLAG_X3DH_INIT
        } else {
            0
        });
        if let Some(init) = &self.init {
            bytes.extend_from_slice(&init.to_bytes());
        }
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse an envelope; strict about lengths, yields nothing on failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::ProtocolViolation("ratchet message too short"));
        }
        if bytes[0] != MESSAGE_VERSION {
            return Err(Error::ProtocolViolation("ratchet message version mismatch"));
        }
        if bytes[1] & !FLAG_X3DH_INIT != 0 {
            return Err(Error::ProtocolViolation("unknown ratchet message flags"));
        }
        let mut offset = 2;

        let init = if bytes[1] & FLAG_X3DH_INIT != 0 {
            let (init, consumed) = X3dhInit::<C>::from_bytes(&bytes[offset..])?;
            offset += consumed;
            Some(init)
        } else {
            None
        };

        let header_len = C::X_PUBLIC_LEN + 8;
        let header_bytes = bytes
            .get(offset..offset + header_len)
            .ok_or(Error::ProtocolViolation("ratchet header truncated"))?;
        let dh_public = DhPublicKey::from_bytes(&header_bytes[..C::X_PUBLIC_LEN])?;
        let previous_chain_length = u32::from_be_bytes(
            header_bytes[C::X_PUBLIC_LEN..C::X_PUBLIC_LEN + 4]
                .try_into()
                .map_err(|_| Error::ProtocolViolation("ratchet header truncated"))?,
        );
        let message_number = u32::from_be_bytes(
            header_bytes[C::X_PUBLIC_LEN + 4..]
                .try_into()
                .map_err(|_| Error::ProtocolViolation("ratchet header truncated"))?,
        );
        offset += header_len;

        Ok(Self {
            init,
            header: RatchetHeader {
                dh_public,
                previous_chain_length,
                message_number,
            },
            ciphertext: bytes[offset..].to_vec(),
        })
    }
}

/// Skipped-key index: raw ratchet public key plus message number.
type SkippedKeyId = (Vec<u8>, u32);

/// Mutable ratchet state, cloned for trial decryption and committed only
/// on success.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
struct State<C: CurveSuite> {
    root_key: SymmetricKey,
    send_chain: Option<SymmetricKey>,
    recv_chain: Option<SymmetricKey>,
    dh_send: DhKeyPair<C>,
    dh_recv: Option<DhPublicKey<C>>,
    send_count: u32,
    recv_count: u32,
    prev_chain_length: u32,
    skipped: HashMap<SkippedKeyId, SymmetricKey>,
    max_skip: u32,
}

/// Everything the store needs to resurrect a session.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
struct Blob<C: CurveSuite> {
    peer_device_id: String,
    ad: SharedAd,
    pending_init: Option<X3dhInit<C>>,
    state: State<C>,
}

/// One Double Ratchet session with a single peer device.
pub struct RatchetSession<C: CurveSuite> {
    db_id: Option<u64>,
    peer_did: i64,
    owner_uid: i64,
    peer_device_id: String,
    ad: SharedAd,
    pending_init: Option<X3dhInit<C>>,
    state: State<C>,
}

impl<C: CurveSuite> RatchetSession<C> {
    /// Build the initiator side from an X3DH derivation.
    ///
    /// Performs the first DH ratchet step against the responder's signed
    /// prekey immediately, so the session can send before the peer ever
    /// comes online.
    pub fn new_initiator<R: CryptoRngCore>(
        rng: &mut R,
        derived: InitiatorSession<C>,
        peer_device_id: &str,
        peer_did: i64,
        owner_uid: i64,
        max_skip: u32,
    ) -> Result<Self> {
        let dh_send = DhKeyPair::generate(rng);
        let dh_out = dh_send.dh(&derived.peer_spk)?;
        let (root_key, send_chain) = kdf_root(&derived.sk, dh_out.as_bytes());

        Ok(Self {
            db_id: None,
            peer_did,
            owner_uid,
            peer_device_id: peer_device_id.to_string(),
            ad: derived.ad,
            pending_init: Some(derived.init),
            state: State {
                root_key,
                send_chain: Some(send_chain),
                recv_chain: None,
                dh_send,
                dh_recv: Some(derived.peer_spk),
                send_count: 0,
                recv_count: 0,
                prev_chain_length: 0,
                skipped: HashMap::new(),
                max_skip,
            },
        })
    }

    /// Build the responder side from an X3DH derivation.
    ///
    /// The signed prekey named by the init header becomes the local
    /// ratchet key; chains start on the first received message.
    pub fn new_responder(
        sk: SymmetricKey,
        ad: SharedAd,
        spk: DhKeyPair<C>,
        peer_device_id: &str,
        peer_did: i64,
        owner_uid: i64,
        max_skip: u32,
    ) -> Self {
        Self {
            db_id: None,
            peer_did,
            owner_uid,
            peer_device_id: peer_device_id.to_string(),
            ad,
            pending_init: None,
            state: State {
                root_key: sk,
                send_chain: None,
                recv_chain: None,
                dh_send: spk,
                dh_recv: None,
                send_count: 0,
                recv_count: 0,
                prev_chain_length: 0,
                skipped: HashMap::new(),
                max_skip,
            },
        }
    }

    /// Store row id, once persisted
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.db_id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.db_id = Some(id);
    }

    /// Local row id of the peer device
    #[must_use]
    pub fn peer_did(&self) -> i64 {
        self.peer_did
    }

    /// Local row id of the owning user
    #[must_use]
    pub fn owner_uid(&self) -> i64 {
        self.owner_uid
    }

    /// Peer device id this session talks to
    #[must_use]
    pub fn peer_device_id(&self) -> &str {
        &self.peer_device_id
    }

    /// Whether outgoing messages still carry the X3DH-init prefix
    #[must_use]
    pub fn awaiting_first_reply(&self) -> bool {
        self.pending_init.is_some()
    }

    /// Encrypt one payload, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage<C>> {
        let chain = self
            .state
            .send_chain
            .as_ref()
            .ok_or(Error::SessionNotReady)?;
        let (new_chain, message_key) = kdf_chain(chain);

        let header = RatchetHeader {
            dh_public: self.state.dh_send.public().clone(),
            previous_chain_length: self.state.prev_chain_length,
            message_number: self.state.send_count,
        };

        let aad = self.aad_for(&header, self.pending_init.as_ref());
        let nonce = nonce_for(header.message_number);
        let ciphertext = aead_seal(&message_key, &nonce, plaintext, &aad)?;

        self.state.send_chain = Some(new_chain);
        self.state.send_count += 1;

        Ok(RatchetMessage {
            init: self.pending_init.clone(),
            header,
            ciphertext,
        })
    }

    /// Decrypt one envelope.
    ///
    /// State only advances when the tag verifies; on any error the
    /// session is exactly as it was, so the caller may try another
    /// candidate session or surface the failure.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &RatchetMessage<C>,
    ) -> Result<Vec<u8>> {
        let mut trial = self.state.clone();
        let aad = self.aad_for(&message.header, message.init.as_ref());
        let plaintext = Self::decrypt_with(&mut trial, rng, message, &aad)?;

        self.state = trial;
        // the peer demonstrably has the session now
        self.pending_init = None;
        Ok(plaintext)
    }

    fn decrypt_with<R: CryptoRngCore>(
        state: &mut State<C>,
        rng: &mut R,
        message: &RatchetMessage<C>,
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let header = &message.header;
        let nonce = nonce_for(header.message_number);
        let skipped_id = (
            header.dh_public.as_bytes().to_vec(),
            header.message_number,
        );

        if let Some(message_key) = state.skipped.remove(&skipped_id) {
            return aead_open(&message_key, &nonce, &message.ciphertext, aad);
        }

        let same_chain = state.dh_recv.as_ref() == Some(&header.dh_public);
        if same_chain && header.message_number < state.recv_count {
            // already consumed and no skipped key left: either replay, or a
            // key that fell off the skip window
            return if header.message_number + state.max_skip < state.recv_count {
                Err(Error::TooManySkipped)
            } else {
                Err(Error::DecryptionFailed)
            };
        }

        if !same_chain {
            // close out the previous receiving chain before stepping
            if state.recv_chain.is_some() {
                Self::skip_to(state, header.previous_chain_length)?;
            }
            Self::dh_ratchet(state, rng, &header.dh_public)?;
        }

        Self::skip_to(state, header.message_number)?;

        let chain = state.recv_chain.as_ref().ok_or(Error::DecryptionFailed)?;
        let (new_chain, message_key) = kdf_chain(chain);
        let plaintext = aead_open(&message_key, &nonce, &message.ciphertext, aad)?;

        state.recv_chain = Some(new_chain);
        state.recv_count = header.message_number + 1;
        Self::evict_stale_skipped(state, &header.dh_public, header.message_number);

        trace!(
            message_number = header.message_number,
            skipped = state.skipped.len(),
            "ratchet message accepted"
        );
        Ok(plaintext)
    }

    /// DH ratchet step on a new remote key.
    fn dh_ratchet<R: CryptoRngCore>(
        state: &mut State<C>,
        rng: &mut R,
        remote: &DhPublicKey<C>,
    ) -> Result<()> {
        state.prev_chain_length = state.send_count;
        state.send_count = 0;
        state.recv_count = 0;

        let dh_out = state.dh_send.dh(remote)?;
        let (root_key, recv_chain) = kdf_root(&state.root_key, dh_out.as_bytes());
        state.root_key = root_key;
        state.recv_chain = Some(recv_chain);
        state.dh_recv = Some(remote.clone());

        state.dh_send = DhKeyPair::generate(rng);
        let dh_out = state.dh_send.dh(remote)?;
        let (root_key, send_chain) = kdf_root(&state.root_key, dh_out.as_bytes());
        state.root_key = root_key;
        state.send_chain = Some(send_chain);

        Ok(())
    }

    /// Advance the receiving chain to `until`, stashing the message keys
    /// passed over. The jump is bounded by the skip budget.
    fn skip_to(state: &mut State<C>, until: u32) -> Result<()> {
        if until <= state.recv_count {
            return Ok(());
        }
        if until - state.recv_count > state.max_skip {
            return Err(Error::TooManySkipped);
        }

        let chain = state.recv_chain.as_ref().ok_or(Error::DecryptionFailed)?;
        let dh_recv = state
            .dh_recv
            .as_ref()
            .ok_or(Error::DecryptionFailed)?
            .as_bytes()
            .to_vec();

        let mut current = chain.clone();
        for number in state.recv_count..until {
            let (next_chain, message_key) = kdf_chain(&current);
            state.skipped.insert((dh_recv.clone(), number), message_key);
            current = next_chain;
        }
        state.recv_chain = Some(current);
        state.recv_count = until;
        Ok(())
    }

    /// Drop stashed keys of the current chain that fell behind the skip
    /// window; a message that old is unrecoverable by contract.
    fn evict_stale_skipped(state: &mut State<C>, chain_key: &DhPublicKey<C>, newest: u32) {
        let chain = chain_key.as_bytes();
        let max_skip = state.max_skip;
        state
            .skipped
            .retain(|(dh, number), _| dh != chain || number + max_skip >= newest);
    }

    fn aad_for(&self, header: &RatchetHeader<C>, init: Option<&X3dhInit<C>>) -> Vec<u8> {
        let mut aad = Vec::with_capacity(32 + C::X_PUBLIC_LEN + 8);
        aad.extend_from_slice(self.ad.as_bytes());
        if let Some(init) = init {
            aad.extend_from_slice(&init.to_bytes());
        }
        aad.extend_from_slice(&header.to_bytes());
        aad
    }

    /// Serialize for the session table.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            peer_device_id: self.peer_device_id.clone(),
            ad: self.ad.clone(),
            pending_init: self.pending_init.clone(),
            state: self.state.clone(),
        };
        bincode::serde::encode_to_vec(&blob, bincode::config::standard())
            .map_err(|_| Error::SessionEncoding)
    }

    /// Rebuild from a session table row.
    pub fn from_blob(db_id: u64, peer_did: i64, owner_uid: i64, blob: &[u8]) -> Result<Self> {
        let (blob, _): (Blob<C>, usize) =
            bincode::serde::decode_from_slice(blob, bincode::config::standard())
                .map_err(|_| Error::SessionEncoding)?;
        Ok(Self {
            db_id: Some(db_id),
            peer_did,
            owner_uid,
            peer_device_id: blob.peer_device_id,
            ad: blob.ad,
            pending_init: blob.pending_init,
            state: blob.state,
        })
    }
}

impl<C: CurveSuite> std::fmt::Debug for RatchetSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("db_id", &self.db_id)
            .field("peer_device_id", &self.peer_device_id)
            .field("send_count", &self.state.send_count)
            .field("recv_count", &self.state.recv_count)
            .field("skipped", &self.state.skipped.len())
            .finish()
    }
}

fn nonce_for(message_number: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&message_number.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Curve25519;
    use crate::keys::SignatureKeyPair;
    use crate::x3dh::{self, PeerBundle};
    use rand_core::OsRng;

    type C = Curve25519;

    fn session_pair(max_skip: u32) -> (RatchetSession<C>, RatchetSession<C>) {
        let alice_ik = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob_ik = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);

        let bundle = PeerBundle {
            device_id: "bob".into(),
            ik: bob_ik.public().clone(),
            spk: spk.public().clone(),
            spk_id: 1,
            spk_sig: bob_ik.sign(spk.public().as_bytes()).unwrap(),
            opk: None,
        };

        let derived = x3dh::initiate(&mut OsRng, &alice_ik, "alice", &bundle).unwrap();
        let init = derived.init.clone();
        let alice =
            RatchetSession::new_initiator(&mut OsRng, derived, "bob", 1, 1, max_skip).unwrap();

        let (sk, ad) = x3dh::respond(&bob_ik, "bob", "alice", &init, &spk, None).unwrap();
        let bob = RatchetSession::new_responder(sk, ad, spk, "alice", 1, 1, max_skip);

        (alice, bob)
    }

    #[test]
    fn basic_exchange() {
        let (mut alice, mut bob) = session_pair(64);

        let msg = alice.encrypt(b"hello bob").unwrap();
        assert!(msg.init.is_some());
        assert_eq!(bob.decrypt(&mut OsRng, &msg).unwrap(), b"hello bob");

        let reply = bob.encrypt(b"hello alice").unwrap();
        assert!(reply.init.is_none());
        assert_eq!(alice.decrypt(&mut OsRng, &reply).unwrap(), b"hello alice");

        // the reply cleared the init attachment
        let second = alice.encrypt(b"again").unwrap();
        assert!(second.init.is_none());
        assert_eq!(bob.decrypt(&mut OsRng, &second).unwrap(), b"again");
    }

    #[test]
    fn responder_cannot_send_before_first_receive() {
        let (_, mut bob) = session_pair(64);
        assert_eq!(bob.encrypt(b"early").unwrap_err(), Error::SessionNotReady);
    }

    #[test]
    fn out_of_order_within_budget() {
        let (mut alice, mut bob) = session_pair(8);

        let messages: Vec<_> = (0..5)
            .map(|i| alice.encrypt(format!("m{i}").as_bytes()).unwrap())
            .collect();

        assert_eq!(bob.decrypt(&mut OsRng, &messages[4]).unwrap(), b"m4");
        assert_eq!(bob.decrypt(&mut OsRng, &messages[0]).unwrap(), b"m0");
        assert_eq!(bob.decrypt(&mut OsRng, &messages[2]).unwrap(), b"m2");
        assert_eq!(bob.decrypt(&mut OsRng, &messages[1]).unwrap(), b"m1");
        assert_eq!(bob.decrypt(&mut OsRng, &messages[3]).unwrap(), b"m3");
    }

    #[test]
    fn skip_budget_bounds_the_jump() {
        let (mut alice, mut bob) = session_pair(3);

        for _ in 0..5 {
            let _ = alice.encrypt(b"dropped").unwrap();
        }
        let late = alice.encrypt(b"way ahead").unwrap();

        // 5 skipped > budget of 3
        assert_eq!(
            bob.decrypt(&mut OsRng, &late).unwrap_err(),
            Error::TooManySkipped
        );
    }

    #[test]
    fn replay_is_rejected_without_corrupting_state() {
        let (mut alice, mut bob) = session_pair(8);

        let msg = alice.encrypt(b"once").unwrap();
        assert_eq!(bob.decrypt(&mut OsRng, &msg).unwrap(), b"once");
        assert_eq!(
            bob.decrypt(&mut OsRng, &msg).unwrap_err(),
            Error::DecryptionFailed
        );

        let next = alice.encrypt(b"twice").unwrap();
        assert_eq!(bob.decrypt(&mut OsRng, &next).unwrap(), b"twice");
    }

    #[test]
    fn failed_decrypt_leaves_state_untouched() {
        let (mut alice, mut bob) = session_pair(8);

        let mut msg = alice.encrypt(b"payload").unwrap();
        msg.ciphertext[0] ^= 1;
        assert_eq!(
            bob.decrypt(&mut OsRng, &msg).unwrap_err(),
            Error::DecryptionFailed
        );

        msg.ciphertext[0] ^= 1;
        assert_eq!(bob.decrypt(&mut OsRng, &msg).unwrap(), b"payload");
    }

    #[test]
    fn envelope_round_trip() {
        let (mut alice, _) = session_pair(8);
        let msg = alice.encrypt(b"wire").unwrap();

        let bytes = msg.to_bytes();
        let parsed = RatchetMessage::<C>::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.header.message_number, msg.header.message_number);
        assert_eq!(parsed.ciphertext, msg.ciphertext);
        assert_eq!(parsed.init.is_some(), msg.init.is_some());

        // a truncated header must not parse
        let header_end = bytes.len() - msg.ciphertext.len();
        assert!(RatchetMessage::<C>::from_bytes(&bytes[..header_end - 1]).is_err());
        assert!(RatchetMessage::<C>::from_bytes(&[MESSAGE_VERSION, 0x80]).is_err());
    }

    #[test]
    fn blob_round_trip_preserves_conversation() {
        let (mut alice, mut bob) = session_pair(8);

        let m1 = alice.encrypt(b"before save").unwrap();
        bob.decrypt(&mut OsRng, &m1).unwrap();

        let blob = bob.to_blob().unwrap();
        let mut restored = RatchetSession::<C>::from_blob(9, bob.peer_did(), 1, &blob).unwrap();
        assert_eq!(restored.id(), Some(9));

        let m2 = alice.encrypt(b"after save").unwrap();
        assert_eq!(restored.decrypt(&mut OsRng, &m2).unwrap(), b"after save");
    }

    #[test]
    fn bidirectional_ratchet_steps() {
        let (mut alice, mut bob) = session_pair(8);

        for round in 0..4 {
            let a = alice.encrypt(format!("a{round}").as_bytes()).unwrap();
            assert_eq!(
                bob.decrypt(&mut OsRng, &a).unwrap(),
                format!("a{round}").as_bytes()
            );
            let b = bob.encrypt(format!("b{round}").as_bytes()).unwrap();
            assert_eq!(
                alice.decrypt(&mut OsRng, &b).unwrap(),
                format!("b{round}").as_bytes()
            );
        }
    }
}
