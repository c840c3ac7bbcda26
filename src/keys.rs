//! Typed key material over a [`CurveSuite`].
//!
//! The wrappers own validation: byte strings entering from the wire or the
//! store are length-checked once, here, so the suite primitives can assume
//! well-formed input. Private halves zeroize on drop.

use crate::curve::CurveSuite;
use crate::error::{Error, Result};
use rand_core::CryptoRngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::marker::PhantomData;
use zeroize::Zeroizing;

/// Signature-scheme public key (long-lived identity key)
#[derive(Clone, PartialEq, Eq)]
pub struct SignaturePublicKey<C: CurveSuite> {
    bytes: Vec<u8>,
    _curve: PhantomData<C>,
}

impl<C: CurveSuite> SignaturePublicKey<C> {
    /// Validate and wrap raw public key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != C::DSA_PUBLIC_LEN {
            return Err(Error::InvalidKey);
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            _curve: PhantomData,
        })
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Verify `signature` over `message` under this key.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        C::verify(&self.bytes, message, signature)
    }

    /// Birational map into the DH group
    pub fn to_dh(&self) -> Result<DhPublicKey<C>> {
        DhPublicKey::from_bytes(&C::signature_public_to_dh(&self.bytes)?)
    }
}

impl<C: CurveSuite> std::fmt::Debug for SignaturePublicKey<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignaturePublicKey([REDACTED])")
    }
}

impl<C: CurveSuite> Serialize for SignaturePublicKey<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bytes)
    }
}

impl<'de, C: CurveSuite> Deserialize<'de> for SignaturePublicKey<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        SignaturePublicKey::from_bytes(&bytes)
            .map_err(|_| D::Error::custom("bad signature public key length"))
    }
}

/// Signature keypair (identity key); private half zeroizes on drop.
#[derive(Clone)]
pub struct SignatureKeyPair<C: CurveSuite> {
    public: SignaturePublicKey<C>,
    private: Zeroizing<Vec<u8>>,
}

impl<C: CurveSuite> SignatureKeyPair<C> {
    /// Generate a fresh keypair.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let (public, private) = C::generate_signature_keypair(rng);
        Self {
            public: SignaturePublicKey {
                bytes: public,
                _curve: PhantomData,
            },
            private,
        }
    }

    /// Rebuild from stored halves.
    pub fn from_parts(public: &[u8], private: &[u8]) -> Result<Self> {
        if private.len() != C::DSA_PRIVATE_LEN {
            return Err(Error::InvalidKey);
        }
        Ok(Self {
            public: SignaturePublicKey::from_bytes(public)?,
            private: Zeroizing::new(private.to_vec()),
        })
    }

    /// Public half
    #[must_use]
    pub fn public(&self) -> &SignaturePublicKey<C> {
        &self.public
    }

    /// Private half, for sealing into the store
    #[must_use]
    pub fn private_bytes(&self) -> &[u8] {
        &self.private
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        C::sign(&self.private, message)
    }

    /// Private half mapped into the DH group
    pub fn private_to_dh(&self) -> Result<Zeroizing<Vec<u8>>> {
        C::signature_private_to_dh(&self.private)
    }
}

impl<C: CurveSuite> std::fmt::Debug for SignatureKeyPair<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureKeyPair([REDACTED])")
    }
}

/// DH public key (prekeys, ephemeral keys, ratchet keys)
#[derive(Clone, PartialEq, Eq)]
pub struct DhPublicKey<C: CurveSuite> {
    bytes: Vec<u8>,
    _curve: PhantomData<C>,
}

impl<C: CurveSuite> DhPublicKey<C> {
    /// Validate and wrap raw public key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != C::X_PUBLIC_LEN {
            return Err(Error::InvalidKey);
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            _curve: PhantomData,
        })
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<C: CurveSuite> std::fmt::Debug for DhPublicKey<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhPublicKey([REDACTED])")
    }
}

impl<C: CurveSuite> Serialize for DhPublicKey<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bytes)
    }
}

impl<'de, C: CurveSuite> Deserialize<'de> for DhPublicKey<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        DhPublicKey::from_bytes(&bytes).map_err(|_| D::Error::custom("bad DH public key length"))
    }
}

/// Output of a DH computation; zeroizes on drop.
pub struct DhOutput(Zeroizing<Vec<u8>>);

impl DhOutput {
    pub(crate) fn new(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    /// Shared secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// DH keypair; private half zeroizes on drop.
#[derive(Clone)]
pub struct DhKeyPair<C: CurveSuite> {
    public: DhPublicKey<C>,
    private: Zeroizing<Vec<u8>>,
}

impl<C: CurveSuite> DhKeyPair<C> {
    /// Generate a fresh keypair.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let (public, private) = C::generate_dh_keypair(rng);
        Self {
            public: DhPublicKey {
                bytes: public,
                _curve: PhantomData,
            },
            private,
        }
    }

    /// Rebuild from stored halves.
    pub fn from_parts(public: &[u8], private: &[u8]) -> Result<Self> {
        if private.len() != C::X_PRIVATE_LEN {
            return Err(Error::InvalidKey);
        }
        Ok(Self {
            public: DhPublicKey::from_bytes(public)?,
            private: Zeroizing::new(private.to_vec()),
        })
    }

    /// Public half
    #[must_use]
    pub fn public(&self) -> &DhPublicKey<C> {
        &self.public
    }

    /// Private half, for sealing into the store
    #[must_use]
    pub fn private_bytes(&self) -> &[u8] {
        &self.private
    }

    /// Diffie-Hellman with a peer public key.
    pub fn dh(&self, peer: &DhPublicKey<C>) -> Result<DhOutput> {
        Ok(DhOutput::new(C::dh(&self.private, &peer.bytes)?))
    }
}

impl<C: CurveSuite> std::fmt::Debug for DhKeyPair<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKeyPair([REDACTED])")
    }
}

impl<C: CurveSuite> Serialize for DhKeyPair<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.public.bytes, self.private.as_slice()).serialize(serializer)
    }
}

impl<'de, C: CurveSuite> Deserialize<'de> for DhKeyPair<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (public, private) = <(Vec<u8>, Vec<u8>)>::deserialize(deserializer)?;
        DhKeyPair::from_parts(&public, &private)
            .map_err(|_| D::Error::custom("bad DH keypair length"))
    }
}

/// Dedicated DH helper used where only raw private bytes are at hand
/// (identity keys converted out of the signature scheme).
pub(crate) fn dh_raw<C: CurveSuite>(private: &[u8], peer: &DhPublicKey<C>) -> Result<DhOutput> {
    Ok(DhOutput::new(C::dh(private, peer.as_bytes())?))
}
