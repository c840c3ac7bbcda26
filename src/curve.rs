//! Curve suite abstraction.
//!
//! Every key length, the signature scheme, and the Diffie-Hellman function
//! are bundled behind [`CurveSuite`]. A device is monomorphic over one
//! suite; material from different suites can never meet at runtime because
//! it never meets at the type level.
//!
//! One suite ships: [`Curve25519`] (Ed25519 signatures, X25519 key
//! agreement). The wire protocol reserves a discriminant for Curve448 so
//! foreign-curve traffic is rejected cleanly at the framing layer.

use crate::error::{Error, Result};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Wire identifier of a curve suite, third byte of every directory header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CurveId {
    /// Curve25519: Ed25519 signatures, X25519 DH
    Curve25519 = 0x01,
    /// Curve448 (wire discriminant only; no arithmetic ships)
    Curve448 = 0x02,
}

impl CurveId {
    /// Decode a wire discriminant.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(CurveId::Curve25519),
            0x02 => Ok(CurveId::Curve448),
            _ => Err(Error::ProtocolViolation("unknown curve id")),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Curve25519 {}
}

/// A complete curve suite: key sizes, signature scheme, and DH function.
///
/// Suites are stateless marker types (hence the `Copy`/`Eq` bounds); all
/// operations work on raw byte slices. The typed wrappers in
/// [`crate::keys`] enforce lengths at their boundaries so the methods here
/// may assume well-formed input sizes.
pub trait CurveSuite:
    sealed::Sealed
    + Sized
    + Send
    + Sync
    + Clone
    + Copy
    + PartialEq
    + Eq
    + std::fmt::Debug
    + 'static
{
    /// Wire identifier for this suite
    const ID: CurveId;
    /// Signature-scheme public key length. Also the length of the 0xFF
    /// domain-separation prefix in the X3DH KDF input.
    const DSA_PUBLIC_LEN: usize;
    /// Signature-scheme private key length
    const DSA_PRIVATE_LEN: usize;
    /// Signature length
    const SIGNATURE_LEN: usize;
    /// DH public key length
    const X_PUBLIC_LEN: usize;
    /// DH private key length
    const X_PRIVATE_LEN: usize;
    /// DH shared secret length
    const SHARED_SECRET_LEN: usize;

    /// Generate a signature keypair; returns `(public, private)`.
    fn generate_signature_keypair<R: CryptoRngCore>(rng: &mut R) -> (Vec<u8>, Zeroizing<Vec<u8>>);

    /// Generate a DH keypair; returns `(public, private)`.
    fn generate_dh_keypair<R: CryptoRngCore>(rng: &mut R) -> (Vec<u8>, Zeroizing<Vec<u8>>);

    /// Sign `message` with a signature-scheme private key.
    fn sign(private: &[u8], message: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature under a signature-scheme public key.
    fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> bool;

    /// Diffie-Hellman between a DH private key and a DH public key.
    fn dh(private: &[u8], public: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Map a signature-scheme public key to the DH group (Ed → Montgomery).
    fn signature_public_to_dh(public: &[u8]) -> Result<Vec<u8>>;

    /// Map a signature-scheme private key to a DH private key.
    fn signature_private_to_dh(private: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// Curve25519 suite: Ed25519 signatures, X25519 key agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve25519;

fn to_32(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| Error::InvalidKey)
}

impl CurveSuite for Curve25519 {
    const ID: CurveId = CurveId::Curve25519;
    const DSA_PUBLIC_LEN: usize = 32;
    const DSA_PRIVATE_LEN: usize = 32;
    const SIGNATURE_LEN: usize = 64;
    const X_PUBLIC_LEN: usize = 32;
    const X_PRIVATE_LEN: usize = 32;
    const SHARED_SECRET_LEN: usize = 32;

    fn generate_signature_keypair<R: CryptoRngCore>(rng: &mut R) -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let signing = SigningKey::generate(rng);
        let public = signing.verifying_key().to_bytes().to_vec();
        let private = Zeroizing::new(signing.to_bytes().to_vec());
        (public, private)
    }

    fn generate_dh_keypair<R: CryptoRngCore>(rng: &mut R) -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let secret = StaticSecret::random_from_rng(&mut *rng);
        let public = X25519PublicKey::from(&secret).as_bytes().to_vec();
        let private = Zeroizing::new(secret.to_bytes().to_vec());
        (public, private)
    }

    fn sign(private: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let signing = SigningKey::from_bytes(&to_32(private)?);
        Ok(signing.sign(message).to_bytes().to_vec())
    }

    fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(pk) = to_32(public) else { return false };
        let Ok(verifying) = VerifyingKey::from_bytes(&pk) else {
            return false;
        };
        let Ok(sig) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        verifying.verify(message, &Signature::from_bytes(&sig)).is_ok()
    }

    fn dh(private: &[u8], public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let secret = StaticSecret::from(to_32(private)?);
        let peer = X25519PublicKey::from(to_32(public)?);
        let shared = secret.diffie_hellman(&peer);
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }

    fn signature_public_to_dh(public: &[u8]) -> Result<Vec<u8>> {
        let compressed =
            CompressedEdwardsY::from_slice(public).map_err(|_| Error::InvalidKey)?;
        let point = compressed.decompress().ok_or(Error::InvalidKey)?;
        Ok(point.to_montgomery().to_bytes().to_vec())
    }

    fn signature_private_to_dh(private: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        // Clamped SHA-512 expansion of the Ed25519 seed, RFC 7748 §5
        let seed = to_32(private)?;
        let mut h = Sha512::digest(seed);
        h[0] &= 248;
        h[31] &= 127;
        h[31] |= 64;
        let out = Zeroizing::new(h[..32].to_vec());
        h.as_mut_slice().zeroize();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn curve_id_roundtrip() {
        assert_eq!(CurveId::from_u8(0x01).unwrap(), CurveId::Curve25519);
        assert_eq!(CurveId::from_u8(0x02).unwrap(), CurveId::Curve448);
        assert!(CurveId::from_u8(0x03).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (public, private) = Curve25519::generate_signature_keypair(&mut OsRng);
        let sig = Curve25519::sign(&private, b"prekey bytes").unwrap();
        assert!(Curve25519::verify(&public, b"prekey bytes", &sig));
        assert!(!Curve25519::verify(&public, b"other bytes", &sig));
    }

    #[test]
    fn dh_commutes() {
        let (pub_a, priv_a) = Curve25519::generate_dh_keypair(&mut OsRng);
        let (pub_b, priv_b) = Curve25519::generate_dh_keypair(&mut OsRng);
        let ab = Curve25519::dh(&priv_a, &pub_b).unwrap();
        let ba = Curve25519::dh(&priv_b, &pub_a).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn converted_identity_keys_agree() {
        // DH between a converted Ed25519 pair and a native X25519 pair must
        // commute, otherwise the X3DH DH1/DH2 legs cannot match.
        let (ed_pub, ed_priv) = Curve25519::generate_signature_keypair(&mut OsRng);
        let (x_pub, x_priv) = Curve25519::generate_dh_keypair(&mut OsRng);

        let converted_priv = Curve25519::signature_private_to_dh(&ed_priv).unwrap();
        let converted_pub = Curve25519::signature_public_to_dh(&ed_pub).unwrap();

        let a = Curve25519::dh(&converted_priv, &x_pub).unwrap();
        let b = Curve25519::dh(&x_priv, &converted_pub).unwrap();
        assert_eq!(*a, *b);
    }
}
