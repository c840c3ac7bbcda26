//! Directory codec round-trips and strictness: every message type
//! encodes and parses back, and truncated frames fail with no partial
//! output.

use rand_core::OsRng;
use x3dh_messaging::protocol::{self, ErrorCode, MessageType, X3dhInit};
use x3dh_messaging::{Curve25519, DhKeyPair, PeerBundle, SignatureKeyPair};

type C = Curve25519;

fn sample_bundle(device_id: &str, with_opk: bool) -> PeerBundle<C> {
    let identity = SignatureKeyPair::<C>::generate(&mut OsRng);
    let spk = DhKeyPair::<C>::generate(&mut OsRng);
    let opk = DhKeyPair::<C>::generate(&mut OsRng);
    PeerBundle {
        device_id: device_id.to_string(),
        ik: identity.public().clone(),
        spk: spk.public().clone(),
        spk_id: 0xDEAD_BEEF,
        spk_sig: identity.sign(spk.public().as_bytes()).unwrap(),
        opk: with_opk.then(|| (opk.public().clone(), 0x0BAD_CAFE)),
    }
}

/// Every strict prefix of a framed message must fail to parse.
fn assert_no_prefix_parses<T>(
    message: &[u8],
    parse: impl Fn(&[u8]) -> x3dh_messaging::Result<T>,
) {
    for len in 0..message.len() {
        assert!(
            parse(&message[..len]).is_err(),
            "prefix of {len} bytes out of {} unexpectedly parsed",
            message.len()
        );
    }
    assert!(parse(message).is_ok());
}

#[test]
fn register_user_round_trip_and_truncation() {
    let identity = SignatureKeyPair::<C>::generate(&mut OsRng);
    let message = protocol::build_register_user::<C>(identity.public());

    assert_eq!(
        protocol::parse_header::<C>(&message).unwrap(),
        MessageType::RegisterUser
    );
    let parsed = protocol::parse_register_user::<C>(&message).unwrap();
    assert_eq!(parsed.as_bytes(), identity.public().as_bytes());

    assert_no_prefix_parses(&message, |bytes| {
        protocol::parse_header::<C>(bytes)?;
        protocol::parse_register_user::<C>(bytes)
    });
}

#[test]
fn delete_user_is_header_only() {
    let message = protocol::build_delete_user::<C>();
    assert_eq!(message.len(), protocol::HEADER_LEN);
    assert_eq!(
        protocol::parse_header::<C>(&message).unwrap(),
        MessageType::DeleteUser
    );
}

#[test]
fn post_spk_round_trip_and_truncation() {
    let identity = SignatureKeyPair::<C>::generate(&mut OsRng);
    let spk = DhKeyPair::<C>::generate(&mut OsRng);
    let sig = identity.sign(spk.public().as_bytes()).unwrap();
    let message = protocol::build_post_spk::<C>(spk.public(), &sig, 0x01020304);

    let (parsed_spk, parsed_sig, spk_id) = protocol::parse_post_spk::<C>(&message).unwrap();
    assert_eq!(&parsed_spk, spk.public());
    assert_eq!(parsed_sig, sig);
    assert_eq!(spk_id, 0x01020304);

    assert_no_prefix_parses(&message, |bytes| {
        protocol::parse_header::<C>(bytes)?;
        protocol::parse_post_spk::<C>(bytes)
    });
}

#[test]
fn post_opks_round_trip_and_truncation() {
    let opks: Vec<_> = (0..4)
        .map(|i| (i + 10, DhKeyPair::<C>::generate(&mut OsRng).public().clone()))
        .collect();
    let message = protocol::build_post_opks::<C>(&opks);

    let parsed = protocol::parse_post_opks::<C>(&message).unwrap();
    assert_eq!(parsed.len(), 4);
    for ((id_a, key_a), (id_b, key_b)) in opks.iter().zip(&parsed) {
        assert_eq!(id_a, id_b);
        assert_eq!(key_a, key_b);
    }

    assert_no_prefix_parses(&message, |bytes| {
        protocol::parse_header::<C>(bytes)?;
        protocol::parse_post_opks::<C>(bytes)
    });

    // an empty batch is a valid frame
    let empty = protocol::build_post_opks::<C>(&[]);
    assert!(protocol::parse_post_opks::<C>(&empty).unwrap().is_empty());
}

#[test]
fn get_peer_bundles_round_trip_and_truncation() {
    let mut ids = vec![
        "alice@example.org;device=1".to_string(),
        "b".to_string(),
        String::new(),
    ];
    let message = protocol::build_get_peer_bundles::<C>(&mut ids);
    assert_eq!(protocol::parse_get_peer_bundles::<C>(&message).unwrap(), ids);

    assert_no_prefix_parses(&message, |bytes| {
        protocol::parse_header::<C>(bytes)?;
        protocol::parse_get_peer_bundles::<C>(bytes)
    });
}

#[test]
fn peer_bundles_round_trip_mixed_opk_presence() {
    let bundles = vec![
        sample_bundle("alice@example.org;device=1", true),
        sample_bundle("alice@example.org;device=2", false),
        sample_bundle("bob@example.org;device=1", true),
    ];
    let message = protocol::build_peer_bundles::<C>(&bundles);

    assert_eq!(
        protocol::parse_header::<C>(&message).unwrap(),
        MessageType::PeerBundle
    );
    let parsed = protocol::parse_peer_bundles::<C>(&message).unwrap();
    assert_eq!(parsed.len(), bundles.len());
    for (expected, actual) in bundles.iter().zip(&parsed) {
        assert_eq!(expected.device_id, actual.device_id);
        assert_eq!(expected.ik.as_bytes(), actual.ik.as_bytes());
        assert_eq!(expected.spk, actual.spk);
        assert_eq!(expected.spk_id, actual.spk_id);
        assert_eq!(expected.spk_sig, actual.spk_sig);
        assert_eq!(expected.opk, actual.opk);
    }

    assert_no_prefix_parses(&message, |bytes| {
        protocol::parse_header::<C>(bytes)?;
        protocol::parse_peer_bundles::<C>(bytes)
    });
}

#[test]
fn error_round_trip_with_and_without_text() {
    for code in [
        ErrorCode::BadContentType,
        ErrorCode::BadCurve,
        ErrorCode::MissingSenderId,
        ErrorCode::BadProtocolVersion,
        ErrorCode::BadSize,
        ErrorCode::UserAlreadyIn,
        ErrorCode::UserNotFound,
        ErrorCode::DbError,
        ErrorCode::BadRequest,
    ] {
        let with_text = protocol::build_error::<C>(code, "diagnostic");
        let (parsed, text) = protocol::parse_error::<C>(&with_text).unwrap();
        assert_eq!(parsed, code);
        assert_eq!(text.as_deref(), Some("diagnostic"));

        let without_text = protocol::build_error::<C>(code, "");
        let (parsed, text) = protocol::parse_error::<C>(&without_text).unwrap();
        assert_eq!(parsed, code);
        assert_eq!(text, None);
    }

    // an error frame without even a code byte is invalid
    let header_only = &protocol::build_error::<C>(ErrorCode::BadRequest, "")
        [..protocol::HEADER_LEN];
    assert!(protocol::parse_error::<C>(header_only).is_err());
}

#[test]
fn unknown_discriminants_are_rejected() {
    let mut message = protocol::build_delete_user::<C>();
    message[1] = 0x42;
    assert!(protocol::parse_header::<C>(&message).is_err());

    let mut message = protocol::build_error::<C>(ErrorCode::BadRequest, "");
    message[protocol::HEADER_LEN] = 0x77;
    assert!(protocol::parse_error::<C>(&message).is_err());
}

#[test]
fn header_mismatch_fails_before_body_inspection() {
    // a version mismatch on an otherwise valid frame rejects the exchange
    let mut message = protocol::build_peer_bundles::<C>(&[sample_bundle("a", true)]);
    message[0] = 0x7F;
    assert!(protocol::parse_header::<C>(&message).is_err());

    // curve mismatch likewise
    let mut message = protocol::build_peer_bundles::<C>(&[sample_bundle("a", true)]);
    message[2] = 0x02;
    assert!(protocol::parse_header::<C>(&message).is_err());
}

#[test]
fn oversized_bundle_request_is_truncated_to_u16() {
    let mut ids: Vec<String> = (0..70_000).map(|i| format!("d{i}")).collect();
    let message = protocol::build_get_peer_bundles::<C>(&mut ids);
    assert_eq!(ids.len(), usize::from(u16::MAX));
    let parsed = protocol::parse_get_peer_bundles::<C>(&message).unwrap();
    assert_eq!(parsed.len(), usize::from(u16::MAX));
    assert_eq!(parsed.first().map(String::as_str), Some("d0"));
}

#[test]
fn x3dh_init_prefix_is_strict() {
    let identity = SignatureKeyPair::<C>::generate(&mut OsRng);
    let ek = DhKeyPair::<C>::generate(&mut OsRng);
    let init = X3dhInit::<C> {
        ik: identity.public().clone(),
        ek: ek.public().clone(),
        spk_id: 12,
        opk_id: Some(34),
    };

    let bytes = init.to_bytes();
    for len in 0..bytes.len() {
        assert!(X3dhInit::<C>::from_bytes(&bytes[..len]).is_err());
    }
    let (parsed, consumed) = X3dhInit::<C>::from_bytes(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(parsed.spk_id, 12);
    assert_eq!(parsed.opk_id, Some(34));
}
