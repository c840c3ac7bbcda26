//! X3DH key agreement.
//!
//! Asynchronous session establishment against a published key bundle:
//! the initiator combines its identity key and one fresh ephemeral key
//! with the responder's identity key, signed prekey, and optional
//! one-time prekey.
//!
//! ```text
//! initiator                         responder
//! DH1 = DH(Ik_a -> X, SPk_b)        DH1 = DH(SPk_b, Ik_a -> X)
//! DH2 = DH(Ek_a, Ik_b -> X)         DH2 = DH(Ik_b -> X, Ek_a)
//! DH3 = DH(Ek_a, SPk_b)             DH3 = DH(SPk_b, Ek_a)
//! DH4 = DH(Ek_a, OPk_b)?            DH4 = DH(OPk_b, Ek_a)?
//!
//! SK = HKDF-SHA512(F || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! `F` is a run of 0xFF bytes of signature-public-key length, prefixed to
//! the keying material for domain separation. Identity keys live in the
//! signature scheme and are mapped into the DH group on use.
//!
//! The associated data bound into every ratchet tag is derived from the
//! two identity keys and the two device ids, ordered initiator first
//! regardless of which side computes it.

use crate::crypto::{x3dh_hkdf, SymmetricKey};
use crate::curve::CurveSuite;
use crate::error::{Error, Result};
use crate::keys::{dh_raw, DhKeyPair, DhPublicKey, SignatureKeyPair, SignaturePublicKey};
use crate::protocol::X3dhInit;
use crate::settings::{X3DH_AD_INFO, X3DH_SK_INFO};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

/// Peer key bundle fetched from the directory, consumed exactly once per
/// initiator-side session build.
#[derive(Debug, Clone)]
pub struct PeerBundle<C: CurveSuite> {
    /// Device the bundle belongs to
    pub device_id: String,
    /// Peer identity key
    pub ik: SignaturePublicKey<C>,
    /// Peer signed prekey
    pub spk: DhPublicKey<C>,
    /// Identifier of the signed prekey
    pub spk_id: u32,
    /// Signature over the signed prekey under `ik`
    pub spk_sig: Vec<u8>,
    /// One-time prekey and its identifier, when the directory had one left
    pub opk: Option<(DhPublicKey<C>, u32)>,
}

impl<C: CurveSuite> PeerBundle<C> {
    /// Verify the signed-prekey signature under the bundle's identity key.
    pub fn verify_signature(&self) -> Result<()> {
        if self.ik.verify(self.spk.as_bytes(), &self.spk_sig) {
            Ok(())
        } else {
            Err(Error::BundleSignatureInvalid {
                device_id: self.device_id.clone(),
            })
        }
    }
}

/// Associated data derived by X3DH and bound into every ratchet tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedAd([u8; 32]);

impl SharedAd {
    /// AD bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Initiator-side output: the session key material plus the init header
/// the responder needs to derive the same values.
pub struct InitiatorSession<C: CurveSuite> {
    /// Initial ratchet root secret
    pub sk: SymmetricKey,
    /// Associated data for the session
    pub ad: SharedAd,
    /// Header to prepend to the first ratchet messages
    pub init: X3dhInit<C>,
    /// Peer signed prekey, doubling as the responder's first ratchet key
    pub peer_spk: DhPublicKey<C>,
    /// Whether the bundle carried (and this build consumed) a one-time
    /// prekey; drives the cache-replacement rule on concurrent inits.
    pub used_opk: bool,
}

impl<C: CurveSuite> std::fmt::Debug for InitiatorSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorSession")
            .field("used_opk", &self.used_opk)
            .finish()
    }
}

/// Generate a signed prekey: a DH keypair whose public half is signed by
/// the identity key.
pub fn generate_spk<C: CurveSuite, R: CryptoRngCore>(
    rng: &mut R,
    identity: &SignatureKeyPair<C>,
) -> Result<(DhKeyPair<C>, Vec<u8>)> {
    let keypair = DhKeyPair::generate(rng);
    let signature = identity.sign(keypair.public().as_bytes())?;
    Ok((keypair, signature))
}

/// Generate a batch of one-time prekeys.
pub fn generate_opks<C: CurveSuite, R: CryptoRngCore>(rng: &mut R, count: u16) -> Vec<DhKeyPair<C>> {
    (0..count).map(|_| DhKeyPair::generate(rng)).collect()
}

fn derive_ad(
    ik_initiator: &[u8],
    ik_responder: &[u8],
    device_initiator: &str,
    device_responder: &str,
) -> SharedAd {
    let mut input = Zeroizing::new(Vec::with_capacity(
        ik_initiator.len()
            + ik_responder.len()
            + device_initiator.len()
            + device_responder.len(),
    ));
    input.extend_from_slice(ik_initiator);
    input.extend_from_slice(ik_responder);
    input.extend_from_slice(device_initiator.as_bytes());
    input.extend_from_slice(device_responder.as_bytes());
    SharedAd(*x3dh_hkdf(&input, X3DH_AD_INFO).as_bytes())
}

/// Initiator side: derive `(SK, AD)` from a verified peer bundle and
/// build the init header.
///
/// A bundle whose prekey signature fails verification is rejected with no
/// side effects; the caller decides whether sibling bundles proceed.
pub fn initiate<C: CurveSuite, R: CryptoRngCore>(
    rng: &mut R,
    identity: &SignatureKeyPair<C>,
    self_device_id: &str,
    bundle: &PeerBundle<C>,
) -> Result<InitiatorSession<C>> {
    bundle.verify_signature()?;

    let self_ik_dh = identity.private_to_dh()?;
    let peer_ik_dh = bundle.ik.to_dh()?;
    let ephemeral = DhKeyPair::<C>::generate(rng);

    // F || DH1 || DH2 || DH3 [|| DH4]
    let mut ikm = Zeroizing::new(vec![0xFFu8; C::DSA_PUBLIC_LEN]);
    ikm.extend_from_slice(dh_raw::<C>(&self_ik_dh, &bundle.spk)?.as_bytes());
    ikm.extend_from_slice(ephemeral.dh(&peer_ik_dh)?.as_bytes());
    ikm.extend_from_slice(ephemeral.dh(&bundle.spk)?.as_bytes());
    if let Some((opk, _)) = &bundle.opk {
        ikm.extend_from_slice(ephemeral.dh(opk)?.as_bytes());
    }

    let sk = x3dh_hkdf(&ikm, X3DH_SK_INFO);
    let ad = derive_ad(
        identity.public().as_bytes(),
        bundle.ik.as_bytes(),
        self_device_id,
        &bundle.device_id,
    );

    let init = X3dhInit {
        ik: identity.public().clone(),
        ek: ephemeral.public().clone(),
        spk_id: bundle.spk_id,
        opk_id: bundle.opk.as_ref().map(|(_, id)| *id),
    };

    debug!(peer = %bundle.device_id, used_opk = bundle.opk.is_some(), "initiator session derived");

    Ok(InitiatorSession {
        sk,
        ad,
        init,
        peer_spk: bundle.spk.clone(),
        used_opk: bundle.opk.is_some(),
    })
}

/// Responder side: rebuild `(SK, AD)` from an init header and the local
/// prekeys it references.
///
/// The caller is responsible for loading the signed prekey named by
/// `init.spk_id` and consuming the one-time prekey named by
/// `init.opk_id` under one transaction.
pub fn respond<C: CurveSuite>(
    identity: &SignatureKeyPair<C>,
    self_device_id: &str,
    sender_device_id: &str,
    init: &X3dhInit<C>,
    spk: &DhKeyPair<C>,
    opk: Option<&DhKeyPair<C>>,
) -> Result<(SymmetricKey, SharedAd)> {
    if let Some(opk_id) = init.opk_id {
        if opk.is_none() {
            return Err(Error::OpkNotFound(opk_id));
        }
    }

    let self_ik_dh = identity.private_to_dh()?;
    let sender_ik_dh = init.ik.to_dh()?;

    // Mirror the initiator's concatenation order exactly.
    let mut ikm = Zeroizing::new(vec![0xFFu8; C::DSA_PUBLIC_LEN]);
    ikm.extend_from_slice(spk.dh(&sender_ik_dh)?.as_bytes());
    ikm.extend_from_slice(dh_raw::<C>(&self_ik_dh, &init.ek)?.as_bytes());
    ikm.extend_from_slice(spk.dh(&init.ek)?.as_bytes());
    if let Some(opk) = opk {
        ikm.extend_from_slice(opk.dh(&init.ek)?.as_bytes());
    }

    let sk = x3dh_hkdf(&ikm, X3DH_SK_INFO);
    let ad = derive_ad(
        init.ik.as_bytes(),
        identity.public().as_bytes(),
        sender_device_id,
        self_device_id,
    );

    Ok((sk, ad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Curve25519;
    use rand_core::OsRng;

    type C = Curve25519;

    fn bundle_for(
        identity: &SignatureKeyPair<C>,
        spk: &DhKeyPair<C>,
        opk: Option<(&DhKeyPair<C>, u32)>,
    ) -> PeerBundle<C> {
        PeerBundle {
            device_id: "bob@example.org".into(),
            ik: identity.public().clone(),
            spk: spk.public().clone(),
            spk_id: 1,
            spk_sig: identity.sign(spk.public().as_bytes()).unwrap(),
            opk: opk.map(|(pair, id)| (pair.public().clone(), id)),
        }
    }

    #[test]
    fn initiator_and_responder_agree_with_opk() {
        let alice = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);
        let opk = DhKeyPair::<C>::generate(&mut OsRng);

        let bundle = bundle_for(&bob, &spk, Some((&opk, 42)));
        let session = initiate(&mut OsRng, &alice, "alice@example.org", &bundle).unwrap();
        assert!(session.used_opk);
        assert_eq!(session.init.opk_id, Some(42));

        let (sk, ad) = respond(
            &bob,
            "bob@example.org",
            "alice@example.org",
            &session.init,
            &spk,
            Some(&opk),
        )
        .unwrap();

        assert_eq!(session.sk.as_bytes(), sk.as_bytes());
        assert_eq!(session.ad, ad);
    }

    #[test]
    fn initiator_and_responder_agree_without_opk() {
        let alice = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);

        let bundle = bundle_for(&bob, &spk, None);
        let session = initiate(&mut OsRng, &alice, "alice@example.org", &bundle).unwrap();
        assert!(!session.used_opk);

        let (sk, ad) = respond(
            &bob,
            "bob@example.org",
            "alice@example.org",
            &session.init,
            &spk,
            None,
        )
        .unwrap();

        assert_eq!(session.sk.as_bytes(), sk.as_bytes());
        assert_eq!(session.ad, ad);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let alice = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);

        let mut bundle = bundle_for(&bob, &spk, None);
        bundle.spk_sig[0] ^= 1;

        let err = initiate(&mut OsRng, &alice, "alice@example.org", &bundle).unwrap_err();
        assert!(matches!(err, Error::BundleSignatureInvalid { .. }));
    }

    #[test]
    fn signature_under_foreign_identity_is_rejected() {
        let alice = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let mallory = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);

        let mut bundle = bundle_for(&bob, &spk, None);
        bundle.spk_sig = mallory.sign(spk.public().as_bytes()).unwrap();

        assert!(initiate(&mut OsRng, &alice, "alice@example.org", &bundle).is_err());
    }

    #[test]
    fn responder_requires_the_opk_named_by_the_header() {
        let alice = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);
        let opk = DhKeyPair::<C>::generate(&mut OsRng);

        let bundle = bundle_for(&bob, &spk, Some((&opk, 7)));
        let session = initiate(&mut OsRng, &alice, "alice@example.org", &bundle).unwrap();

        let err = respond(
            &bob,
            "bob@example.org",
            "alice@example.org",
            &session.init,
            &spk,
            None,
        )
        .unwrap_err();
        assert_eq!(err, Error::OpkNotFound(7));
    }

    #[test]
    fn hkdf_input_shrinks_by_one_dh_without_opk() {
        // Indirect check on the keying-material layout: the derived keys
        // with and without DH4 must differ even when everything else is
        // fixed.
        let alice = SignatureKeyPair::<C>::generate(&mut OsRng);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let spk = DhKeyPair::<C>::generate(&mut OsRng);
        let opk = DhKeyPair::<C>::generate(&mut OsRng);

        let with_opk = bundle_for(&bob, &spk, Some((&opk, 7)));
        let without_opk = bundle_for(&bob, &spk, None);

        let a = initiate(&mut OsRng, &alice, "alice@example.org", &with_opk).unwrap();
        let b = initiate(&mut OsRng, &alice, "alice@example.org", &without_opk).unwrap();
        assert_ne!(a.sk.as_bytes(), b.sk.as_bytes());
    }
}
