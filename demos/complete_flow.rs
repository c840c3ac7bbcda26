//! Complete walk-through: two users register against a directory,
//! exchange a handshake, and message each other through the ratchet.
//!
//! The directory lives in-process; swap the transport for an HTTP client
//! to talk to a real server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use x3dh_messaging::protocol::{self, ErrorCode, MessageType};
use x3dh_messaging::storage::MemoryStorage;
use x3dh_messaging::{
    CallbackStatus, Curve25519, Device, DhPublicKey, DirectoryRequest, DirectoryResponder,
    DirectoryTransport, PeerBundle, RecipientData, Settings, SignaturePublicKey,
};

type C = Curve25519;

/// Minimal in-process directory: registration, prekey upload, bundle
/// serving with one-time-prekey consumption.
#[derive(Default)]
struct Directory {
    users: Mutex<HashMap<String, UserRecord>>,
}

struct UserRecord {
    ik: SignaturePublicKey<C>,
    spk: Option<(DhPublicKey<C>, Vec<u8>, u32)>,
    opks: Vec<(DhPublicKey<C>, u32)>,
}

impl Directory {
    fn handle(&self, from: &str, body: &[u8]) -> Vec<u8> {
        let Ok(message_type) = protocol::parse_header::<C>(body) else {
            return protocol::build_error::<C>(ErrorCode::BadRequest, "bad header");
        };
        let mut users = self.users.lock().expect("directory lock");

        match message_type {
            MessageType::RegisterUser => match protocol::parse_register_user::<C>(body) {
                Ok(ik) if !users.contains_key(from) => {
                    users.insert(
                        from.to_string(),
                        UserRecord {
                            ik,
                            spk: None,
                            opks: Vec::new(),
                        },
                    );
                    protocol::build_ack::<C>(MessageType::RegisterUser)
                }
                Ok(_) => protocol::build_error::<C>(ErrorCode::UserAlreadyIn, ""),
                Err(_) => protocol::build_error::<C>(ErrorCode::BadSize, ""),
            },
            MessageType::PostSpk => match (protocol::parse_post_spk::<C>(body), users.get_mut(from)) {
                (Ok((spk, sig, id)), Some(user)) => {
                    user.spk = Some((spk, sig, id));
                    protocol::build_ack::<C>(MessageType::PostSpk)
                }
                _ => protocol::build_error::<C>(ErrorCode::UserNotFound, ""),
            },
            MessageType::PostOpks => match (protocol::parse_post_opks::<C>(body), users.get_mut(from)) {
                (Ok(opks), Some(user)) => {
                    user.opks
                        .extend(opks.into_iter().map(|(id, key)| (key, id)));
                    protocol::build_ack::<C>(MessageType::PostOpks)
                }
                _ => protocol::build_error::<C>(ErrorCode::UserNotFound, ""),
            },
            MessageType::GetPeerBundle => {
                let Ok(device_ids) = protocol::parse_get_peer_bundles::<C>(body) else {
                    return protocol::build_error::<C>(ErrorCode::BadSize, "");
                };
                let mut bundles = Vec::new();
                for device_id in device_ids {
                    let Some(user) = users.get_mut(&device_id) else { continue };
                    let Some((spk, sig, spk_id)) = user.spk.clone() else { continue };
                    let opk = (!user.opks.is_empty()).then(|| user.opks.remove(0));
                    bundles.push(PeerBundle {
                        device_id,
                        ik: user.ik.clone(),
                        spk,
                        spk_id,
                        spk_sig: sig,
                        opk,
                    });
                }
                protocol::build_peer_bundles::<C>(&bundles)
            }
            MessageType::DeleteUser => {
                users.remove(from);
                protocol::build_ack::<C>(MessageType::DeleteUser)
            }
            _ => protocol::build_error::<C>(ErrorCode::BadRequest, ""),
        }
    }
}

struct InProcessTransport(Arc<Directory>);

impl DirectoryTransport<C> for InProcessTransport {
    fn post(&self, request: DirectoryRequest, responder: DirectoryResponder<C>) {
        let response = self.0.handle(&request.from, &request.body);
        responder.resolve(200, response);
    }
}

fn expect_success(step: &'static str) -> impl FnOnce(CallbackStatus, String) + Send {
    move |status, note| {
        assert_eq!(status, CallbackStatus::Success, "{step}: {note}");
        println!("   ok: {step}");
    }
}

fn main() {
    let directory = Arc::new(Directory::default());

    println!("1. registering alice and bob...");
    let alice = Device::create_user(
        "alice@example.org;device=1",
        "https://x3dh.example.org",
        Arc::new(MemoryStorage::<C>::new()),
        Arc::new(InProcessTransport(directory.clone())),
        Settings::default(),
        expect_success("alice registered"),
    )
    .expect("alice local creation");

    let bob = Device::create_user(
        "bob@example.org;device=1",
        "https://x3dh.example.org",
        Arc::new(MemoryStorage::<C>::new()),
        Arc::new(InProcessTransport(directory.clone())),
        Settings::default(),
        expect_success("bob registered"),
    )
    .expect("bob local creation");

    println!("2. bob encrypts to alice (bundle fetch + X3DH happen underneath)...");
    let recipients = Arc::new(Mutex::new(vec![RecipientData::new(
        "alice@example.org;device=1",
    )]));
    let cipher_message = Arc::new(Mutex::new(Vec::new()));
    bob.encrypt(
        "alice",
        recipients.clone(),
        b"hello alice, this went through X3DH",
        cipher_message.clone(),
        expect_success("message encrypted"),
    );

    println!("3. alice decrypts the first message (receiver-side X3DH)...");
    let envelope = recipients.lock().expect("recipients")[0].message.clone();
    let payload = cipher_message.lock().expect("cipher message").clone();
    let plaintext = alice
        .decrypt("bob@example.org;device=1", "alice", &envelope, &payload)
        .expect("decrypt");
    println!("   alice read: {}", String::from_utf8_lossy(&plaintext));

    println!("4. alice replies over the established session...");
    let recipients = Arc::new(Mutex::new(vec![RecipientData::new(
        "bob@example.org;device=1",
    )]));
    let cipher_message = Arc::new(Mutex::new(Vec::new()));
    alice.encrypt(
        "bob",
        recipients.clone(),
        b"hello bob, ratchet turning",
        cipher_message.clone(),
        expect_success("reply encrypted"),
    );

    let envelope = recipients.lock().expect("recipients")[0].message.clone();
    let payload = cipher_message.lock().expect("cipher message").clone();
    let plaintext = bob
        .decrypt("alice@example.org;device=1", "bob", &envelope, &payload)
        .expect("decrypt reply");
    println!("   bob read: {}", String::from_utf8_lossy(&plaintext));

    println!("done.");
}
