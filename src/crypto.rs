//! Key derivation and symmetric encryption.
//!
//! X3DH derivations use HKDF-SHA512 implemented as a single
//! extract-then-expand round: the requested output is 32 bytes, which one
//! round of SHA-512 expansion covers.
//!
//! ```text
//! PRK = HMAC-SHA512(salt = 64 x 0x00, ikm)
//! out = HMAC-SHA512(PRK, info || 0x01)[..32]
//! ```
//!
//! The ratchet chains use HKDF-SHA512 (root chain) and the two HMAC
//! constants 0x01/0x02 (message chains).

use crate::error::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha512 = Hmac<Sha512>;

/// Size of derived symmetric keys
pub const KEY_LEN: usize = 32;

/// AEAD nonce length (ChaCha20-Poly1305)
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length
pub const TAG_LEN: usize = 16;

/// HKDF info string for the Double Ratchet root chain
const ROOT_INFO: &[u8] = b"x3dh-messaging ratchet root";

/// Derived 32-byte symmetric key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

impl Serialize for SymmetricKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("bad symmetric key length"))?;
        Ok(Self(arr))
    }
}

/// HMAC-SHA512 of `data` under `key`.
#[must_use]
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// One-round HKDF-SHA512 with a zero-filled 64-byte salt:
/// `PRK = HMAC(salt, ikm)`, `out = HMAC(PRK, info || 0x01)[..32]`.
///
/// The input keying material is expected to arrive in a [`Zeroizing`]
/// buffer owned by the caller; the intermediate PRK is wiped here.
#[must_use]
pub fn x3dh_hkdf(ikm: &[u8], info: &[u8]) -> SymmetricKey {
    let mut prk = hmac_sha512(&[0u8; 64], ikm);

    let mut round = Vec::with_capacity(info.len() + 1);
    round.extend_from_slice(info);
    round.push(0x01);
    let mut okm = hmac_sha512(&prk, &round);

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&okm[..KEY_LEN]);

    prk.zeroize();
    okm.zeroize();
    SymmetricKey(out)
}

/// Root-chain step: `(root', chain) = HKDF-SHA512(salt=root, ikm=dh, ROOT_INFO)`
#[must_use]
pub fn kdf_root(root_key: &SymmetricKey, dh_output: &[u8]) -> (SymmetricKey, SymmetricKey) {
    let hkdf = Hkdf::<Sha512>::new(Some(root_key.as_bytes()), dh_output);

    let mut output = Zeroizing::new([0u8; 2 * KEY_LEN]);
    hkdf.expand(ROOT_INFO, &mut *output)
        .expect("output size is valid");

    let mut new_root = [0u8; KEY_LEN];
    let mut new_chain = [0u8; KEY_LEN];
    new_root.copy_from_slice(&output[..KEY_LEN]);
    new_chain.copy_from_slice(&output[KEY_LEN..]);

    (SymmetricKey(new_root), SymmetricKey(new_chain))
}

/// Message-chain step: `mk = HMAC(ck, 0x01)`, `ck' = HMAC(ck, 0x02)`
#[must_use]
pub fn kdf_chain(chain_key: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
    let step = |label: u8| -> SymmetricKey {
        let mut digest = hmac_sha512(chain_key.as_bytes(), &[label]);
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&digest[..KEY_LEN]);
        digest.zeroize();
        SymmetricKey(out)
    };

    let message_key = step(0x01);
    let new_chain_key = step(0x02);
    (new_chain_key, message_key)
}

/// AEAD-seal `plaintext` (ChaCha20-Poly1305).
pub fn aead_seal(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::DecryptionFailed)
}

/// AEAD-open a ciphertext; tag mismatch is [`Error::DecryptionFailed`].
pub fn aead_open(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(Error::DecryptionFailed);
    }
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::DecryptionFailed)
}

/// Constant-time equality on byte strings.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
