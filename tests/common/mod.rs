//! In-process directory server and transports for end-to-end tests.
//!
//! The server implements the directory side of the wire protocol with
//! the crate's own codec: registration, prekey publication, and bundle
//! serving with one-time-prekey consumption.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use x3dh_messaging::protocol::{self, ErrorCode, MessageType};
use x3dh_messaging::storage::{MemoryStorage, Storage, StorageTx};
use x3dh_messaging::{
    CallbackStatus, Curve25519, Device, DhPublicKey, DirectoryRequest, DirectoryResponder,
    DirectoryTransport, PeerBundle, Settings, SignaturePublicKey,
};

pub type C = Curve25519;

struct ServerUser {
    ik: SignaturePublicKey<C>,
    spk: Option<(DhPublicKey<C>, Vec<u8>, u32)>,
    opks: VecDeque<(DhPublicKey<C>, u32)>,
}

/// Directory server semantics over the wire codec.
pub struct DirectoryServer {
    users: Mutex<HashMap<String, ServerUser>>,
}

impl DirectoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_user(&self, device_id: &str) -> bool {
        self.users.lock().unwrap().contains_key(device_id)
    }

    pub fn opk_count(&self, device_id: &str) -> usize {
        self.users
            .lock()
            .unwrap()
            .get(device_id)
            .map_or(0, |user| user.opks.len())
    }

    pub fn spk_id(&self, device_id: &str) -> Option<u32> {
        self.users
            .lock()
            .unwrap()
            .get(device_id)
            .and_then(|user| user.spk.as_ref().map(|(_, _, id)| *id))
    }

    /// Flip one bit in a stored prekey signature, for rejection tests.
    pub fn corrupt_spk_signature(&self, device_id: &str) {
        let mut users = self.users.lock().unwrap();
        if let Some((_, sig, _)) = users
            .get_mut(device_id)
            .and_then(|user| user.spk.as_mut())
        {
            sig[0] ^= 1;
        }
    }

    /// Drop all remaining one-time prekeys for a user.
    pub fn drain_opks(&self, device_id: &str) {
        if let Some(user) = self.users.lock().unwrap().get_mut(device_id) {
            user.opks.clear();
        }
    }

    pub fn handle(&self, from: &str, body: &[u8]) -> Vec<u8> {
        let message_type = match protocol::parse_header::<C>(body) {
            Ok(message_type) => message_type,
            Err(_) => return protocol::build_error::<C>(ErrorCode::BadRequest, "bad header"),
        };
        if from.is_empty() {
            return protocol::build_error::<C>(ErrorCode::MissingSenderId, "");
        }
        let mut users = self.users.lock().unwrap();

        match message_type {
            MessageType::RegisterUser => {
                let ik = match protocol::parse_register_user::<C>(body) {
                    Ok(ik) => ik,
                    Err(_) => {
                        return protocol::build_error::<C>(ErrorCode::BadSize, "bad registerUser")
                    }
                };
                if users.contains_key(from) {
                    return protocol::build_error::<C>(
                        ErrorCode::UserAlreadyIn,
                        "device already registered",
                    );
                }
                users.insert(
                    from.to_string(),
                    ServerUser {
                        ik,
                        spk: None,
                        opks: VecDeque::new(),
                    },
                );
                protocol::build_ack::<C>(MessageType::RegisterUser)
            }
            MessageType::DeleteUser => {
                if users.remove(from).is_none() {
                    return protocol::build_error::<C>(ErrorCode::UserNotFound, "");
                }
                protocol::build_ack::<C>(MessageType::DeleteUser)
            }
            MessageType::PostSpk => {
                let (spk, sig, spk_id) = match protocol::parse_post_spk::<C>(body) {
                    Ok(parsed) => parsed,
                    Err(_) => return protocol::build_error::<C>(ErrorCode::BadSize, "bad postSPk"),
                };
                match users.get_mut(from) {
                    Some(user) => {
                        user.spk = Some((spk, sig, spk_id));
                        protocol::build_ack::<C>(MessageType::PostSpk)
                    }
                    None => protocol::build_error::<C>(ErrorCode::UserNotFound, ""),
                }
            }
            MessageType::PostOpks => {
                let opks = match protocol::parse_post_opks::<C>(body) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        return protocol::build_error::<C>(ErrorCode::BadSize, "bad postOPks")
                    }
                };
                match users.get_mut(from) {
                    Some(user) => {
                        for (opk_id, opk) in opks {
                            user.opks.push_back((opk, opk_id));
                        }
                        protocol::build_ack::<C>(MessageType::PostOpks)
                    }
                    None => protocol::build_error::<C>(ErrorCode::UserNotFound, ""),
                }
            }
            MessageType::GetPeerBundle => {
                let device_ids = match protocol::parse_get_peer_bundles::<C>(body) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        return protocol::build_error::<C>(ErrorCode::BadSize, "bad getPeerBundle")
                    }
                };
                let mut bundles = Vec::new();
                for device_id in device_ids {
                    let Some(user) = users.get_mut(&device_id) else {
                        continue;
                    };
                    let Some((spk, sig, spk_id)) = user.spk.clone() else {
                        continue;
                    };
                    let opk = user.opks.pop_front();
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
            MessageType::PeerBundle | MessageType::Error => {
                protocol::build_error::<C>(ErrorCode::BadRequest, "client-only message")
            }
        }
    }
}

/// Transport that answers synchronously from an in-process server.
pub struct LoopbackTransport {
    server: Arc<DirectoryServer>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<DirectoryServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

impl DirectoryTransport<C> for LoopbackTransport {
    fn post(&self, request: DirectoryRequest, responder: DirectoryResponder<C>) {
        let response = self.server.handle(&request.from, &request.body);
        responder.resolve(200, response);
    }
}

/// Transport that parks requests until the test delivers them, for
/// exercising queueing and cancellation.
pub struct ManualTransport {
    server: Arc<DirectoryServer>,
    parked: Mutex<VecDeque<(DirectoryRequest, DirectoryResponder<C>)>>,
}

impl ManualTransport {
    pub fn new(server: Arc<DirectoryServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            parked: Mutex::new(VecDeque::new()),
        })
    }

    pub fn pending(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    /// Deliver the oldest parked request; returns whether one existed.
    pub fn deliver_next(&self) -> bool {
        let Some((request, responder)) = self.parked.lock().unwrap().pop_front() else {
            return false;
        };
        let response = self.server.handle(&request.from, &request.body);
        responder.resolve(200, response);
        true
    }

    pub fn deliver_all(&self) {
        while self.deliver_next() {}
    }

    /// Drop the oldest parked request, simulating a transport failure.
    pub fn fail_next(&self) -> bool {
        let Some((_, responder)) = self.parked.lock().unwrap().pop_front() else {
            return false;
        };
        responder.resolve(503, Vec::new());
        true
    }
}

impl DirectoryTransport<C> for ManualTransport {
    fn post(&self, request: DirectoryRequest, responder: DirectoryResponder<C>) {
        self.parked.lock().unwrap().push_back((request, responder));
    }
}

/// Captures a callback outcome for later assertion.
#[derive(Clone, Default)]
pub struct StatusProbe {
    outcome: Arc<Mutex<Option<(CallbackStatus, String)>>>,
}

impl StatusProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> impl FnOnce(CallbackStatus, String) + Send + 'static {
        let outcome = self.outcome.clone();
        move |status, note| {
            *outcome.lock().unwrap() = Some((status, note));
        }
    }

    pub fn outcome(&self) -> Option<(CallbackStatus, String)> {
        self.outcome.lock().unwrap().clone()
    }

    pub fn assert_success(&self) {
        match self.outcome() {
            Some((CallbackStatus::Success, _)) => {}
            other => panic!("expected success, got {other:?}"),
        }
    }

    pub fn assert_fail(&self) {
        match self.outcome() {
            Some((CallbackStatus::Fail, _)) => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

/// Register a user end-to-end against the in-process server.
pub fn registered_device(
    device_id: &str,
    server: &Arc<DirectoryServer>,
    settings: Settings,
) -> (Device<C>, Arc<MemoryStorage<C>>) {
    let storage = Arc::new(MemoryStorage::<C>::new());
    let transport = LoopbackTransport::new(server.clone());
    let probe = StatusProbe::new();
    let device = Device::create_user(
        device_id,
        "https://x3dh.example.org",
        storage.clone(),
        transport,
        settings,
        probe.hook(),
    )
    .expect("local user creation");
    probe.assert_success();
    assert!(server.has_user(device_id), "registration must reach the server");
    (device, storage)
}

/// Number of one-time prekeys left in a device's local store.
pub fn local_opk_count(storage: &Arc<MemoryStorage<C>>, device_id: &str) -> usize {
    let mut tx = storage.transaction().unwrap();
    let user = tx.load_self(device_id).unwrap();
    tx.opk_count(user.uid).unwrap()
}
