//! Per-device protocol state: lifecycle, session cache, and the
//! encryption/decryption dispatcher.
//!
//! A [`Device`] owns everything for one installed user: the identity
//! keypair, the store handle, the in-memory session cache, and the FIFO
//! of encryption requests waiting on a key-bundle fetch. All mutation
//! funnels through one mutex; directory callbacks hold only a weak
//! reference and marshal back through [`handle_response`], so a device
//! that has been dropped turns its in-flight work into no-ops and its
//! queued work into `cancelled`.
//!
//! Top-level operations report through a single callback
//! `(status, diagnostic string)`; recipient-level outcomes of a fan-out
//! encryption land in each [`RecipientData`].

use crate::curve::CurveSuite;
use crate::crypto::{aead_open, aead_seal, SymmetricKey, KEY_LEN, NONCE_LEN};
use crate::double_ratchet::{RatchetMessage, RatchetSession};
use crate::error::{Error, Result};
use crate::keys::SignatureKeyPair;
use crate::protocol::{self, ErrorCode, MessageType};
use crate::settings::Settings;
use crate::storage::Storage;
use crate::transport::{DirectoryRequest, DirectoryResponder, DirectoryTransport};
use crate::x3dh::{self, PeerBundle};
use rand_core::{OsRng, RngCore};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Outcome of a top-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Operation completed
    Success,
    /// Operation failed; the string carries the diagnostic
    Fail,
}

/// Completion callback for asynchronous operations.
pub type Callback = Box<dyn FnOnce(CallbackStatus, String) + Send + 'static>;

/// Per-recipient outcome of a fan-out encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientStatus {
    /// Not yet processed
    Pending,
    /// `message` holds the ratchet envelope for this device
    Encrypted,
    /// This recipient failed; the others are unaffected
    Failed(Error),
}

/// One recipient device of an encryption request.
#[derive(Debug, Clone)]
pub struct RecipientData {
    /// Target device id
    pub device_id: String,
    /// Ratchet envelope, filled on success
    pub message: Vec<u8>,
    /// Outcome for this recipient
    pub status: RecipientStatus,
}

impl RecipientData {
    /// New pending recipient.
    #[must_use]
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            message: Vec::new(),
            status: RecipientStatus::Pending,
        }
    }
}

/// Registration progresses `register -> SPk -> OPks`; any deviation
/// tears the local user back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationStage {
    WaitingRegisterAck,
    WaitingSpkAck,
    WaitingOpkAck,
}

/// What an in-flight directory request was for.
pub(crate) enum ResponseContext {
    Registration {
        stage: RegistrationStage,
        callback: Option<Callback>,
    },
    PublishSpk {
        spk_id: u32,
        callback: Option<Callback>,
    },
    PublishOpks {
        opk_ids: Vec<u32>,
        callback: Option<Callback>,
    },
    DeleteUser {
        callback: Option<Callback>,
    },
    BundleFetch,
}

impl std::fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseContext::Registration { stage, .. } => {
                return write!(f, "Registration({stage:?})")
            }
            ResponseContext::PublishSpk { .. } => "PublishSpk",
            ResponseContext::PublishOpks { .. } => "PublishOpks",
            ResponseContext::DeleteUser { .. } => "DeleteUser",
            ResponseContext::BundleFetch => "BundleFetch",
        };
        f.write_str(name)
    }
}

/// An encryption request, either in flight or queued behind one.
struct PendingEncryption {
    recipient_user_id: String,
    recipients: Arc<Mutex<Vec<RecipientData>>>,
    plaintext: Zeroizing<Vec<u8>>,
    cipher_message: Arc<Mutex<Vec<u8>>>,
    callback: Option<Callback>,
}

/// Work to perform after the device lock is released: outgoing posts and
/// user callbacks. Keeps transports and application code out of the
/// critical section.
#[derive(Default)]
struct Effects {
    posts: Vec<(Vec<u8>, ResponseContext)>,
    callbacks: Vec<(Callback, CallbackStatus, String)>,
}

impl Effects {
    fn callback(&mut self, callback: Option<Callback>, status: CallbackStatus, message: String) {
        if let Some(callback) = callback {
            self.callbacks.push((callback, status, message));
        }
    }
}

/// One installed user device.
pub struct Device<C: CurveSuite> {
    inner: Arc<Mutex<DeviceInner<C>>>,
}

pub(crate) struct DeviceInner<C: CurveSuite> {
    device_id: String,
    uid: i64,
    server_url: String,
    identity: SignatureKeyPair<C>,
    settings: Settings,
    storage: Arc<dyn Storage<C>>,
    transport: Arc<dyn DirectoryTransport<C>>,
    session_cache: HashMap<String, Arc<Mutex<RatchetSession<C>>>>,
    ongoing_encryption: Option<PendingEncryption>,
    encryption_queue: VecDeque<PendingEncryption>,
}

impl<C: CurveSuite> Device<C> {
    /// Create a new user: store the identity locally, then drive the
    /// `register -> publish SPk -> publish OPks` machine against the
    /// directory. The callback reports the machine's outcome; any
    /// failure rolls the local user back out.
    pub fn create_user(
        device_id: &str,
        server_url: &str,
        storage: Arc<dyn Storage<C>>,
        transport: Arc<dyn DirectoryTransport<C>>,
        settings: Settings,
        callback: impl FnOnce(CallbackStatus, String) + Send + 'static,
    ) -> Result<Self> {
        let mut rng = OsRng;
        let identity = SignatureKeyPair::generate(&mut rng);
        let register = protocol::build_register_user::<C>(identity.public());

        let mut tx = storage.transaction()?;
        let uid = tx.store_self(device_id, &identity, server_url)?;
        tx.commit()?;

        info!(device_id, "local user created, registering with directory");

        let device = Self {
            inner: Arc::new(Mutex::new(DeviceInner {
                device_id: device_id.to_string(),
                uid,
                server_url: server_url.to_string(),
                identity,
                settings,
                storage,
                transport,
                session_cache: HashMap::new(),
                ongoing_encryption: None,
                encryption_queue: VecDeque::new(),
            })),
        };

        device.post(
            register,
            ResponseContext::Registration {
                stage: RegistrationStage::WaitingRegisterAck,
                callback: Some(Box::new(callback)),
            },
        );
        Ok(device)
    }

    /// Load an existing user from the store.
    pub fn load_user(
        device_id: &str,
        storage: Arc<dyn Storage<C>>,
        transport: Arc<dyn DirectoryTransport<C>>,
        settings: Settings,
    ) -> Result<Self> {
        let mut tx = storage.transaction()?;
        let user = tx.load_self(device_id)?;
        tx.commit()?;

        Ok(Self {
            inner: Arc::new(Mutex::new(DeviceInner {
                device_id: device_id.to_string(),
                uid: user.uid,
                server_url: user.server_url,
                identity: user.identity,
                settings,
                storage,
                transport,
                session_cache: HashMap::new(),
                ongoing_encryption: None,
                encryption_queue: VecDeque::new(),
            })),
        })
    }

    /// This device's id.
    #[must_use]
    pub fn device_id(&self) -> String {
        self.inner
            .lock()
            .map(|inner| inner.device_id.clone())
            .unwrap_or_default()
    }

    /// Delete the user from the directory, then locally (cascading to
    /// prekeys and sessions).
    pub fn delete_user(&self, callback: impl FnOnce(CallbackStatus, String) + Send + 'static) {
        self.post(
            protocol::build_delete_user::<C>(),
            ResponseContext::DeleteUser {
                callback: Some(Box::new(callback)),
            },
        );
    }

    /// Rotate the signed prekey when it is older than
    /// [`Settings::spk_lifetime`], and purge prekeys whose
    /// post-rotation grace expired. No-op (with success callback) while
    /// the active prekey is fresh.
    pub fn update_spk(&self, callback: impl FnOnce(CallbackStatus, String) + Send + 'static) {
        let callback: Callback = Box::new(callback);
        let staged = {
            let Ok(mut inner) = self.inner.lock() else {
                callback(CallbackStatus::Fail, "device lock poisoned".into());
                return;
            };
            inner.stage_spk_rotation()
        };
        match staged {
            Ok(Some((spk_id, message))) => self.post(
                message,
                ResponseContext::PublishSpk {
                    spk_id,
                    callback: Some(callback),
                },
            ),
            Ok(None) => callback(CallbackStatus::Success, "signed prekey still fresh".into()),
            Err(err) => callback(CallbackStatus::Fail, err.to_string()),
        }
    }

    /// Generate and publish a fresh batch of one-time prekeys.
    pub fn replenish_opks(&self, callback: impl FnOnce(CallbackStatus, String) + Send + 'static) {
        let callback: Callback = Box::new(callback);
        let staged = {
            let Ok(mut inner) = self.inner.lock() else {
                callback(CallbackStatus::Fail, "device lock poisoned".into());
                return;
            };
            let count = inner.settings.opk_batch_count;
            inner.stage_opk_batch(count)
        };
        match staged {
            Ok((opk_ids, message)) => self.post(
                message,
                ResponseContext::PublishOpks {
                    opk_ids,
                    callback: Some(callback),
                },
            ),
            Err(err) => callback(CallbackStatus::Fail, err.to_string()),
        }
    }

    /// Encrypt `plaintext` for every recipient device in one pass.
    ///
    /// One sealed payload is shared by all recipients and lands in
    /// `cipher_message`; each recipient gets its own ratchet envelope in
    /// its [`RecipientData`]. Recipients without an established session
    /// suspend the request on a bundle fetch; requests issued meanwhile
    /// queue up and complete in FIFO order.
    pub fn encrypt(
        &self,
        recipient_user_id: &str,
        recipients: Arc<Mutex<Vec<RecipientData>>>,
        plaintext: &[u8],
        cipher_message: Arc<Mutex<Vec<u8>>>,
        callback: impl FnOnce(CallbackStatus, String) + Send + 'static,
    ) {
        let pending = PendingEncryption {
            recipient_user_id: recipient_user_id.to_string(),
            recipients,
            plaintext: Zeroizing::new(plaintext.to_vec()),
            cipher_message,
            callback: Some(Box::new(callback)),
        };

        let effects = {
            let Ok(mut inner) = self.inner.lock() else {
                let mut effects = Effects::default();
                effects.callback(
                    pending.callback,
                    CallbackStatus::Fail,
                    "device lock poisoned".into(),
                );
                self.flush(effects);
                return;
            };
            let mut effects = Effects::default();
            if inner.ongoing_encryption.is_some() {
                debug!("bundle fetch in flight, queueing encryption request");
                inner.encryption_queue.push_back(pending);
            } else {
                inner.begin_encryption(pending, &mut effects);
            }
            effects
        };
        self.flush(effects);
    }

    /// Decrypt one incoming envelope from `sender_device_id`.
    ///
    /// Candidate sessions are tried most-recently-active first; if the
    /// envelope carries an X3DH-init prefix and no candidate accepts it,
    /// a receiver-side session is derived from the referenced prekeys
    /// (consuming the one-time prekey transactionally with the session
    /// persist).
    pub fn decrypt(
        &self,
        sender_device_id: &str,
        recipient_user_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
    ) -> Result<Vec<u8>> {
        let message = RatchetMessage::<C>::from_bytes(dr_message)?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("device lock poisoned".into()))?;
        inner.decrypt(sender_device_id, recipient_user_id, &message, cipher_message)
    }

    /// Row id of the cached session for a peer device, if any. Lets
    /// applications (and tests) audit cache/store coherence.
    #[must_use]
    pub fn cached_session_id(&self, peer_device_id: &str) -> Option<u64> {
        let inner = self.inner.lock().ok()?;
        let session = inner.session_cache.get(peer_device_id)?;
        let session = session.lock().ok()?;
        session.id()
    }

    fn post(&self, body: Vec<u8>, context: ResponseContext) {
        let mut effects = Effects::default();
        effects.posts.push((body, context));
        self.flush(effects);
    }

    /// Issue posts and run callbacks with the device lock released.
    fn flush(&self, effects: Effects) {
        if !effects.posts.is_empty() {
            let Ok(inner) = self.inner.lock() else { return };
            let transport = inner.transport.clone();
            let url = inner.server_url.clone();
            let from = inner.device_id.clone();
            drop(inner);

            for (body, context) in effects.posts {
                transport.post(
                    DirectoryRequest::new(&url, &from, body),
                    DirectoryResponder {
                        device: Arc::downgrade(&self.inner),
                        context,
                    },
                );
            }
        }
        for (callback, status, message) in effects.callbacks {
            callback(status, message);
        }
    }
}

impl<C: CurveSuite> std::fmt::Debug for Device<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

/// Entry point for directory responses; called by
/// [`DirectoryResponder::resolve`] after upgrading its weak reference.
pub(crate) fn handle_response<C: CurveSuite>(
    device: &Arc<Mutex<DeviceInner<C>>>,
    context: ResponseContext,
    status: u16,
    body: Vec<u8>,
) {
    let (effects, transport, url, from) = {
        let Ok(mut inner) = device.lock() else { return };
        let effects = inner.process_response(context, status, &body);
        (
            effects,
            inner.transport.clone(),
            inner.server_url.clone(),
            inner.device_id.clone(),
        )
    };

    for (post_body, post_context) in effects.posts {
        transport.post(
            DirectoryRequest::new(&url, &from, post_body),
            DirectoryResponder {
                device: Arc::downgrade(device),
                context: post_context,
            },
        );
    }
    for (callback, callback_status, message) in effects.callbacks {
        callback(callback_status, message);
    }
}

impl<C: CurveSuite> DeviceInner<C> {
    fn process_response(
        &mut self,
        context: ResponseContext,
        status: u16,
        body: &[u8],
    ) -> Effects {
        let mut effects = Effects::default();

        if status != 200 {
            warn!(status, ?context, "directory request failed at transport level");
            self.fail_context(context, &Error::Transport, &mut effects);
            return effects;
        }

        let message_type = match protocol::parse_header::<C>(body) {
            Ok(message_type) => message_type,
            Err(err) => {
                error!(%err, "invalid response from directory server");
                self.fail_context(context, &err, &mut effects);
                return effects;
            }
        };

        if message_type == MessageType::Error {
            let err = match protocol::parse_error::<C>(body) {
                Ok((code, text)) => {
                    error!(?code, text = text.as_deref().unwrap_or(""), "directory error");
                    Error::Server(code)
                }
                Err(err) => err,
            };
            self.fail_context(context, &err, &mut effects);
            return effects;
        }

        match context {
            ResponseContext::Registration { stage, callback } => {
                self.advance_registration(stage, callback, message_type, &mut effects);
            }
            ResponseContext::PublishSpk { spk_id, callback } => {
                if message_type == MessageType::PostSpk {
                    match self.finalize_spk_rotation(spk_id) {
                        Ok(()) => effects.callback(
                            callback,
                            CallbackStatus::Success,
                            "signed prekey rotated".into(),
                        ),
                        Err(err) => self.fail_context(
                            ResponseContext::PublishSpk { spk_id, callback },
                            &err,
                            &mut effects,
                        ),
                    }
                } else {
                    self.fail_context(
                        ResponseContext::PublishSpk { spk_id, callback },
                        &Error::ProtocolViolation("unexpected response type"),
                        &mut effects,
                    );
                }
            }
            ResponseContext::PublishOpks { opk_ids, callback } => {
                if message_type == MessageType::PostOpks {
                    effects.callback(
                        callback,
                        CallbackStatus::Success,
                        format!("{} one-time prekeys published", opk_ids.len()),
                    );
                } else {
                    self.fail_context(
                        ResponseContext::PublishOpks { opk_ids, callback },
                        &Error::ProtocolViolation("unexpected response type"),
                        &mut effects,
                    );
                }
            }
            ResponseContext::DeleteUser { callback } => {
                if message_type == MessageType::DeleteUser {
                    match self.delete_local_user() {
                        Ok(()) => effects.callback(
                            callback,
                            CallbackStatus::Success,
                            "user deleted".into(),
                        ),
                        Err(err) => {
                            effects.callback(callback, CallbackStatus::Fail, err.to_string());
                        }
                    }
                } else {
                    effects.callback(
                        callback,
                        CallbackStatus::Fail,
                        "unexpected response type".into(),
                    );
                }
            }
            ResponseContext::BundleFetch => {
                if message_type == MessageType::PeerBundle {
                    self.finish_bundle_fetch(body, &mut effects);
                } else {
                    self.fail_context(
                        ResponseContext::BundleFetch,
                        &Error::ProtocolViolation("unexpected response type"),
                        &mut effects,
                    );
                }
            }
        }
        effects
    }

    /// Error path per context: compensate local mutations, then surface
    /// the failure.
    fn fail_context(&mut self, context: ResponseContext, err: &Error, effects: &mut Effects) {
        match context {
            ResponseContext::Registration { callback, .. } => {
                // tear the half-registered user back down; on
                // user_already_in the server never accepted us either
                if let Err(rollback_err) = self.delete_local_user() {
                    error!(%rollback_err, "registration rollback failed");
                }
                effects.callback(
                    callback,
                    CallbackStatus::Fail,
                    format!("registration failed: {err}"),
                );
            }
            ResponseContext::PublishSpk { spk_id, callback } => {
                if let Err(rollback_err) = self.discard_spk(spk_id) {
                    error!(%rollback_err, spk_id, "signed prekey rollback failed");
                }
                effects.callback(
                    callback,
                    CallbackStatus::Fail,
                    format!("signed prekey publication failed: {err}"),
                );
            }
            ResponseContext::PublishOpks { opk_ids, callback } => {
                if let Err(rollback_err) = self.discard_opks(&opk_ids) {
                    error!(%rollback_err, "one-time prekey rollback failed");
                }
                effects.callback(
                    callback,
                    CallbackStatus::Fail,
                    format!("one-time prekey publication failed: {err}"),
                );
            }
            ResponseContext::DeleteUser { callback } => {
                effects.callback(
                    callback,
                    CallbackStatus::Fail,
                    format!("user deletion failed: {err}"),
                );
            }
            ResponseContext::BundleFetch => {
                if let Some(pending) = self.ongoing_encryption.take() {
                    fail_remaining_recipients(&pending, err);
                    effects.callback(
                        pending.callback,
                        CallbackStatus::Fail,
                        format!("bundle fetch failed: {err}"),
                    );
                }
                self.start_next_queued(effects);
            }
        }
    }

    fn advance_registration(
        &mut self,
        stage: RegistrationStage,
        callback: Option<Callback>,
        message_type: MessageType,
        effects: &mut Effects,
    ) {
        match (stage, message_type) {
            (RegistrationStage::WaitingRegisterAck, MessageType::RegisterUser) => {
                debug!("identity registered, publishing signed prekey");
                match self.stage_new_spk() {
                    Ok((_, message)) => effects.posts.push((
                        message,
                        ResponseContext::Registration {
                            stage: RegistrationStage::WaitingSpkAck,
                            callback,
                        },
                    )),
                    Err(err) => self.fail_context(
                        ResponseContext::Registration { stage, callback },
                        &err,
                        effects,
                    ),
                }
            }
            (RegistrationStage::WaitingSpkAck, MessageType::PostSpk) => {
                debug!("signed prekey accepted, publishing one-time prekeys");
                let count = self.settings.opk_batch_count;
                match self.stage_opk_batch(count) {
                    Ok((_, message)) => effects.posts.push((
                        message,
                        ResponseContext::Registration {
                            stage: RegistrationStage::WaitingOpkAck,
                            callback,
                        },
                    )),
                    Err(err) => self.fail_context(
                        ResponseContext::Registration { stage, callback },
                        &err,
                        effects,
                    ),
                }
            }
            (RegistrationStage::WaitingOpkAck, MessageType::PostOpks) => {
                info!(device_id = %self.device_id, "user registration complete");
                effects.callback(callback, CallbackStatus::Success, String::new());
            }
            (stage, message_type) => {
                warn!(?stage, ?message_type, "unexpected response during registration");
                self.fail_context(
                    ResponseContext::Registration { stage, callback },
                    &Error::ProtocolViolation("unexpected response type"),
                    effects,
                );
            }
        }
    }

    // ── prekey staging and compensation ──────────────────────────────

    /// Generate and store a signed prekey, returning the publish message.
    fn stage_new_spk(&mut self) -> Result<(u32, Vec<u8>)> {
        let mut tx = self.storage.transaction()?;
        let spk_id = tx.next_spk_id(self.uid)?;
        let (keypair, signature) = x3dh::generate_spk::<C, _>(&mut OsRng, &self.identity)?;
        tx.store_spk(self.uid, spk_id, &keypair)?;
        tx.commit()?;
        Ok((
            spk_id,
            protocol::build_post_spk::<C>(keypair.public(), &signature, spk_id),
        ))
    }

    /// Rotation check: purge expired prekeys, then stage a new one if
    /// the active prekey has outlived [`Settings::spk_lifetime`].
    fn stage_spk_rotation(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        let now = SystemTime::now();
        {
            let mut tx = self.storage.transaction()?;
            if let Some(cutoff) = now.checked_sub(self.settings.spk_keep_after_rotation) {
                let purged = tx.purge_spks_deactivated_before(self.uid, cutoff)?;
                if purged > 0 {
                    info!(purged, "purged signed prekeys past their grace period");
                }
            }
            if let Some(active) = tx.active_spk(self.uid)? {
                let age = now
                    .duration_since(active.created_at)
                    .unwrap_or_default();
                if age < self.settings.spk_lifetime {
                    tx.commit()?;
                    return Ok(None);
                }
            }
            tx.commit()?;
        }
        self.stage_new_spk().map(Some)
    }

    /// Called on the server's postSPk ack: elder prekeys stop being
    /// served but stay loadable through their grace period.
    fn finalize_spk_rotation(&mut self, spk_id: u32) -> Result<()> {
        let mut tx = self.storage.transaction()?;
        tx.deactivate_older_spks(self.uid, spk_id)?;
        tx.commit()
    }

    fn discard_spk(&mut self, spk_id: u32) -> Result<()> {
        let mut tx = self.storage.transaction()?;
        tx.delete_spk(self.uid, spk_id)?;
        tx.commit()
    }

    /// Generate and store a batch of one-time prekeys, returning their
    /// ids and the publish message.
    fn stage_opk_batch(&mut self, count: u16) -> Result<(Vec<u32>, Vec<u8>)> {
        let mut tx = self.storage.transaction()?;
        let keypairs = x3dh::generate_opks::<C, _>(&mut OsRng, count);
        let mut wire = Vec::with_capacity(keypairs.len());
        let mut opk_ids = Vec::with_capacity(keypairs.len());
        for keypair in &keypairs {
            let opk_id = tx.next_opk_id(self.uid)?;
            tx.store_opk(self.uid, opk_id, keypair)?;
            wire.push((opk_id, keypair.public().clone()));
            opk_ids.push(opk_id);
        }
        tx.commit()?;
        Ok((opk_ids, protocol::build_post_opks::<C>(&wire)))
    }

    fn discard_opks(&mut self, opk_ids: &[u32]) -> Result<()> {
        let mut tx = self.storage.transaction()?;
        tx.delete_opks(self.uid, opk_ids)?;
        tx.commit()
    }

    fn delete_local_user(&mut self) -> Result<()> {
        let mut tx = self.storage.transaction()?;
        tx.delete_self(&self.device_id)?;
        tx.commit()?;
        self.session_cache.clear();
        Ok(())
    }

    // ── encryption dispatch ──────────────────────────────────────────

    /// Resolve sessions for every recipient; either encrypt now or
    /// suspend on a bundle fetch.
    fn begin_encryption(&mut self, pending: PendingEncryption, effects: &mut Effects) {
        let missing = match self.resolve_sessions(&pending) {
            Ok(missing) => missing,
            Err(err) => {
                fail_remaining_recipients(&pending, &err);
                effects.callback(pending.callback, CallbackStatus::Fail, err.to_string());
                return;
            }
        };

        if missing.is_empty() {
            self.perform_encryption(pending, effects);
        } else {
            debug!(missing = missing.len(), "fetching key bundles before encrypting");
            let mut device_ids = missing;
            let message = protocol::build_get_peer_bundles::<C>(&mut device_ids);
            self.ongoing_encryption = Some(pending);
            effects.posts.push((message, ResponseContext::BundleFetch));
        }
    }

    /// Cache hit, else most recent persisted session, else needs-bundle.
    fn resolve_sessions(&mut self, pending: &PendingEncryption) -> Result<Vec<String>> {
        let recipients = pending
            .recipients
            .lock()
            .map_err(|_| Error::Storage("recipients lock poisoned".into()))?;

        let mut missing = Vec::new();
        for recipient in recipients.iter() {
            if self.session_cache.contains_key(&recipient.device_id) {
                continue;
            }
            let mut tx = self.storage.transaction()?;
            let Some(peer_did) = tx.find_peer(&recipient.device_id)? else {
                missing.push(recipient.device_id.clone());
                continue;
            };
            let rows = tx.load_sessions_for(self.uid, peer_did)?;
            tx.commit()?;
            match rows.first() {
                Some(row) => {
                    let session =
                        RatchetSession::from_blob(row.id, peer_did, self.uid, &row.blob)?;
                    self.session_cache.insert(
                        recipient.device_id.clone(),
                        Arc::new(Mutex::new(session)),
                    );
                }
                None => missing.push(recipient.device_id.clone()),
            }
        }
        Ok(missing)
    }

    /// Bundles arrived: build a sender session per bundle, then run the
    /// suspended encryption and drain the queue.
    fn finish_bundle_fetch(&mut self, body: &[u8], effects: &mut Effects) {
        let bundles = match protocol::parse_peer_bundles::<C>(body) {
            Ok(bundles) => bundles,
            Err(err) => {
                error!(%err, "invalid peerBundle response");
                self.fail_context(ResponseContext::BundleFetch, &err, effects);
                return;
            }
        };

        let Some(pending) = self.ongoing_encryption.take() else {
            warn!("peerBundle response without a suspended encryption");
            return;
        };

        for bundle in bundles {
            let device_id = bundle.device_id.clone();
            if let Err(err) = self.build_sender_session(bundle) {
                warn!(%err, peer = %device_id, "peer bundle rejected");
                mark_recipient_failed(&pending, &device_id, err);
            }
        }

        self.perform_encryption(pending, effects);
        self.start_next_queued(effects);
    }

    /// Verify, derive, and install one initiator-side session.
    ///
    /// The cache-replacement rule on a concurrent-init race: a bundle
    /// that carried an OPk replaces whatever session the peer's own init
    /// installed (the peer must see its OPk consumed); a bundle without
    /// one defers to the existing session.
    fn build_sender_session(&mut self, bundle: PeerBundle<C>) -> Result<()> {
        let derived = x3dh::initiate(&mut OsRng, &self.identity, &self.device_id, &bundle)?;
        let used_opk = derived.used_opk;

        let mut tx = self.storage.transaction()?;
        let peer_did = tx.store_peer(&bundle.device_id, &bundle.ik)?;
        tx.commit()?;

        let session = RatchetSession::new_initiator(
            &mut OsRng,
            derived,
            &bundle.device_id,
            peer_did,
            self.uid,
            self.settings.max_message_skip,
        )?;

        match self.session_cache.entry(bundle.device_id.clone()) {
            Entry::Occupied(mut entry) => {
                if used_opk {
                    debug!(peer = %bundle.device_id, "concurrent init: fresh session with OPk replaces cached one");
                    entry.insert(Arc::new(Mutex::new(session)));
                } else {
                    debug!(peer = %bundle.device_id, "concurrent init: keeping existing session, discarding fresh one");
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(session)));
            }
        }
        info!(peer = %bundle.device_id, "sender session established");
        Ok(())
    }

    /// All sessions resolved: seal the payload once and produce one
    /// ratchet envelope per recipient. Per-recipient failures are
    /// collected; the whole operation fails only when nobody got an
    /// envelope.
    fn perform_encryption(&mut self, pending: PendingEncryption, effects: &mut Effects) {
        let mut rng = OsRng;

        let mut payload_key_bytes = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill_bytes(&mut *payload_key_bytes);
        let payload_key = SymmetricKey::from_bytes(*payload_key_bytes);

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let sealed = match aead_seal(
            &payload_key,
            &nonce,
            &pending.plaintext,
            pending.recipient_user_id.as_bytes(),
        ) {
            Ok(sealed) => sealed,
            Err(err) => {
                fail_remaining_recipients(&pending, &err);
                effects.callback(pending.callback, CallbackStatus::Fail, err.to_string());
                return;
            }
        };

        {
            let Ok(mut cipher_message) = pending.cipher_message.lock() else {
                effects.callback(
                    pending.callback,
                    CallbackStatus::Fail,
                    "cipher message lock poisoned".into(),
                );
                return;
            };
            cipher_message.clear();
            cipher_message.extend_from_slice(&nonce);
            cipher_message.extend_from_slice(&sealed);
        }

        let outcome = self.encrypt_for_recipients(&pending, payload_key.as_bytes());
        match outcome {
            Ok((delivered, total)) if delivered > 0 => {
                let note = if delivered == total {
                    format!("encrypted for {delivered} recipient devices")
                } else {
                    format!("encrypted for {delivered} of {total} recipient devices")
                };
                effects.callback(pending.callback, CallbackStatus::Success, note);
            }
            Ok((_, total)) => {
                effects.callback(
                    pending.callback,
                    CallbackStatus::Fail,
                    format!("no usable session for any of {total} recipient devices"),
                );
            }
            Err(err) => {
                effects.callback(pending.callback, CallbackStatus::Fail, err.to_string());
            }
        }
    }

    fn encrypt_for_recipients(
        &mut self,
        pending: &PendingEncryption,
        payload_key: &[u8],
    ) -> Result<(usize, usize)> {
        let mut recipients = pending
            .recipients
            .lock()
            .map_err(|_| Error::Storage("recipients lock poisoned".into()))?;

        let mut tx = self.storage.transaction()?;
        let mut delivered = 0;
        let total = recipients.len();

        for recipient in recipients.iter_mut() {
            if matches!(recipient.status, RecipientStatus::Failed(_)) {
                continue;
            }
            let Some(session) = self.session_cache.get(&recipient.device_id) else {
                recipient.status =
                    RecipientStatus::Failed(Error::Server(ErrorCode::UserNotFound));
                continue;
            };
            let mut session = session
                .lock()
                .map_err(|_| Error::Storage("session lock poisoned".into()))?;

            match session.encrypt(payload_key) {
                Ok(envelope) => {
                    let blob = session.to_blob()?;
                    let id =
                        tx.save_session(self.uid, session.peer_did(), session.id(), &blob)?;
                    session.set_id(id);
                    recipient.message = envelope.to_bytes();
                    recipient.status = RecipientStatus::Encrypted;
                    delivered += 1;
                }
                Err(err) => {
                    warn!(%err, peer = %recipient.device_id, "recipient skipped");
                    recipient.status = RecipientStatus::Failed(err);
                }
            }
        }
        tx.commit()?;
        Ok((delivered, total))
    }

    fn start_next_queued(&mut self, effects: &mut Effects) {
        while self.ongoing_encryption.is_none() {
            let Some(pending) = self.encryption_queue.pop_front() else {
                break;
            };
            self.begin_encryption(pending, effects);
        }
    }

    // ── decryption dispatch ──────────────────────────────────────────

    fn decrypt(
        &mut self,
        sender_device_id: &str,
        recipient_user_id: &str,
        message: &RatchetMessage<C>,
        cipher_message: &[u8],
    ) -> Result<Vec<u8>> {
        let mut candidates: Vec<Arc<Mutex<RatchetSession<C>>>> = Vec::new();
        let mut cached_id = None;

        if let Some(session) = self.session_cache.get(sender_device_id) {
            cached_id = session.lock().ok().and_then(|session| session.id());
            candidates.push(session.clone());
        }

        {
            let mut tx = self.storage.transaction()?;
            if let Some(peer_did) = tx.find_peer(sender_device_id)? {
                for row in tx.load_sessions_for(self.uid, peer_did)? {
                    if Some(row.id) == cached_id {
                        continue;
                    }
                    let session =
                        RatchetSession::from_blob(row.id, peer_did, self.uid, &row.blob)?;
                    candidates.push(Arc::new(Mutex::new(session)));
                }
            }
            tx.commit()?;
        }

        let tried_any = !candidates.is_empty();
        let mut saw_skip_overflow = false;

        for candidate in candidates {
            let mut session = candidate
                .lock()
                .map_err(|_| Error::Storage("session lock poisoned".into()))?;
            match session.decrypt(&mut OsRng, message) {
                Ok(payload_key) => {
                    let plaintext =
                        open_payload(&payload_key, cipher_message, recipient_user_id)?;
                    let blob = session.to_blob()?;
                    let mut tx = self.storage.transaction()?;
                    let id =
                        tx.save_session(self.uid, session.peer_did(), session.id(), &blob)?;
                    tx.commit()?;
                    session.set_id(id);
                    drop(session);
                    self.session_cache
                        .insert(sender_device_id.to_string(), candidate.clone());
                    return Ok(plaintext);
                }
                Err(Error::TooManySkipped) => saw_skip_overflow = true,
                Err(_) => {}
            }
        }

        if message.init.is_some() {
            match self.decrypt_via_receiver_session(
                sender_device_id,
                recipient_user_id,
                message,
                cipher_message,
            ) {
                Ok(plaintext) => return Ok(plaintext),
                // a candidate already diagnosed an exceeded skip budget;
                // that verdict outranks the fallback's bookkeeping errors
                Err(_) if saw_skip_overflow => return Err(Error::TooManySkipped),
                // a consumed OPk after a candidate existed is a replayed
                // init message, not a configuration problem
                Err(Error::OpkNotFound(_)) if tried_any => {
                    return Err(Error::DecryptionFailed)
                }
                Err(err) => return Err(err),
            }
        }

        Err(if saw_skip_overflow {
            Error::TooManySkipped
        } else {
            Error::DecryptionFailed
        })
    }

    /// Receiver-side X3DH: derive the session from the referenced
    /// prekeys and persist it atomically with the one-time prekey
    /// deletion. Nothing commits until both the ratchet decrypt and the
    /// shared-payload open have succeeded, so any failure rolls the
    /// whole operation back.
    fn decrypt_via_receiver_session(
        &mut self,
        sender_device_id: &str,
        recipient_user_id: &str,
        message: &RatchetMessage<C>,
        cipher_message: &[u8],
    ) -> Result<Vec<u8>> {
        let init = message
            .init
            .as_ref()
            .ok_or(Error::DecryptionFailed)?;

        let mut tx = self.storage.transaction()?;
        let spk = tx.load_spk(self.uid, init.spk_id)?;
        let opk = match init.opk_id {
            Some(opk_id) => Some(tx.consume_opk(self.uid, opk_id)?),
            None => None,
        };

        let (sk, ad) = x3dh::respond(
            &self.identity,
            &self.device_id,
            sender_device_id,
            init,
            &spk,
            opk.as_ref(),
        )?;
        let peer_did = tx.store_peer(sender_device_id, &init.ik)?;

        let mut session = RatchetSession::new_responder(
            sk,
            ad,
            spk,
            sender_device_id,
            peer_did,
            self.uid,
            self.settings.max_message_skip,
        );

        let payload_key = session.decrypt(&mut OsRng, message)?;
        let plaintext = open_payload(&payload_key, cipher_message, recipient_user_id)?;

        let blob = session.to_blob()?;
        let id = tx.save_session(self.uid, peer_did, None, &blob)?;
        session.set_id(id);
        tx.commit()?;

        info!(peer = %sender_device_id, "receiver session established");

        self.session_cache.insert(
            sender_device_id.to_string(),
            Arc::new(Mutex::new(session)),
        );
        Ok(plaintext)
    }
}

impl<C: CurveSuite> Drop for DeviceInner<C> {
    fn drop(&mut self) {
        // the owner is gone: everything still waiting completes as
        // cancelled rather than silently never
        if let Some(pending) = self.ongoing_encryption.take() {
            fail_remaining_recipients(&pending, &Error::Cancelled);
            if let Some(callback) = pending.callback {
                callback(CallbackStatus::Fail, Error::Cancelled.to_string());
            }
        }
        while let Some(pending) = self.encryption_queue.pop_front() {
            fail_remaining_recipients(&pending, &Error::Cancelled);
            if let Some(callback) = pending.callback {
                callback(CallbackStatus::Fail, Error::Cancelled.to_string());
            }
        }
    }
}

/// Unseal the shared payload with the key recovered from a ratchet
/// envelope.
fn open_payload(
    payload_key: &[u8],
    cipher_message: &[u8],
    recipient_user_id: &str,
) -> Result<Vec<u8>> {
    if cipher_message.len() < NONCE_LEN {
        return Err(Error::DecryptionFailed);
    }
    let key_bytes: [u8; KEY_LEN] = payload_key
        .try_into()
        .map_err(|_| Error::DecryptionFailed)?;
    let key = SymmetricKey::from_bytes(key_bytes);
    let nonce: [u8; NONCE_LEN] = cipher_message[..NONCE_LEN]
        .try_into()
        .map_err(|_| Error::DecryptionFailed)?;
    aead_open(
        &key,
        &nonce,
        &cipher_message[NONCE_LEN..],
        recipient_user_id.as_bytes(),
    )
}

fn mark_recipient_failed(pending: &PendingEncryption, device_id: &str, err: Error) {
    if let Ok(mut recipients) = pending.recipients.lock() {
        for recipient in recipients
            .iter_mut()
            .filter(|recipient| recipient.device_id == device_id)
        {
            recipient.status = RecipientStatus::Failed(err.clone());
        }
    }
}

fn fail_remaining_recipients(pending: &PendingEncryption, err: &Error) {
    if let Ok(mut recipients) = pending.recipients.lock() {
        for recipient in recipients
            .iter_mut()
            .filter(|recipient| recipient.status == RecipientStatus::Pending)
        {
            recipient.status = RecipientStatus::Failed(err.clone());
        }
    }
}
