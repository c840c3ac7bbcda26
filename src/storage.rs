//! Local store contracts.
//!
//! The persistence engine itself is a collaborator; the core talks to it
//! through [`Storage`], whose only operation opens a [`StorageTx`]. All
//! typed accessors live on the transaction, and a transaction dropped
//! without [`StorageTx::commit`] rolls back — which is what lets a
//! receiver-side handshake delete the consumed one-time prekey and
//! persist the new session atomically, and lets any failed operation
//! leave no partial state behind.
//!
//! [`MemoryStorage`] is the bundled implementation: a snapshot-rollback
//! table set behind a mutex, thread-safe by design. Applications with a
//! SQL engine implement the same two traits on top of it.

use crate::crypto::constant_time_eq;
use crate::curve::CurveSuite;
use crate::error::{Error, Result};
use crate::keys::{DhKeyPair, SignatureKeyPair, SignaturePublicKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Loaded self-user row.
#[derive(Debug, Clone)]
pub struct SelfUser<C: CurveSuite> {
    /// Local row id, foreign key for prekeys and sessions
    pub uid: i64,
    /// Identity keypair
    pub identity: SignatureKeyPair<C>,
    /// Directory server this user is registered against
    pub server_url: String,
}

/// Stored signed prekey.
#[derive(Debug, Clone)]
pub struct SpkRecord<C: CurveSuite> {
    /// Monotonically assigned identifier
    pub spk_id: u32,
    /// The DH keypair
    pub keypair: DhKeyPair<C>,
    /// Whether this is the prekey currently served in bundles
    pub active: bool,
    /// Creation time, drives rotation
    pub created_at: SystemTime,
}

/// Persisted session row, MRU-ordered by [`StorageTx::load_sessions_for`].
#[derive(Debug, Clone)]
pub struct SessionRow {
    /// Row id
    pub id: u64,
    /// Opaque ratchet state
    pub blob: Vec<u8>,
    /// Superseded by a more recently active session for the same peer
    pub stale: bool,
}

/// Transactional store handle.
pub trait Storage<C: CurveSuite>: Send + Sync {
    /// Open a transaction. Dropping it without commit rolls back.
    fn transaction<'a>(&'a self) -> Result<Box<dyn StorageTx<C> + 'a>>;
}

/// One open transaction over the local store.
///
/// Reads and writes compose freely; nothing is visible to other
/// transactions until [`StorageTx::commit`].
pub trait StorageTx<C: CurveSuite> {
    /// Insert the self user; fails if the device id is already present.
    fn store_self(
        &mut self,
        device_id: &str,
        identity: &SignatureKeyPair<C>,
        server_url: &str,
    ) -> Result<i64>;

    /// Load the self user by device id.
    fn load_self(&mut self, device_id: &str) -> Result<SelfUser<C>>;

    /// Remove the self user, cascading to its prekeys and sessions.
    fn delete_self(&mut self, device_id: &str) -> Result<()>;

    /// Next signed-prekey id; monotonic per user, never reused.
    fn next_spk_id(&mut self, owner: i64) -> Result<u32>;

    /// Insert a signed prekey as the active one.
    fn store_spk(&mut self, owner: i64, spk_id: u32, keypair: &DhKeyPair<C>) -> Result<()>;

    /// Load a signed prekey by id, active or in grace.
    fn load_spk(&mut self, owner: i64, spk_id: u32) -> Result<DhKeyPair<C>>;

    /// Most recently created active signed prekey, if any.
    fn active_spk(&mut self, owner: i64) -> Result<Option<SpkRecord<C>>>;

    /// Deactivate every signed prekey except `keep_spk_id`.
    fn deactivate_older_spks(&mut self, owner: i64, keep_spk_id: u32) -> Result<()>;

    /// Drop inactive signed prekeys deactivated before `cutoff`; returns
    /// how many were purged.
    fn purge_spks_deactivated_before(&mut self, owner: i64, cutoff: SystemTime) -> Result<usize>;

    /// Remove one signed prekey outright (compensation path).
    fn delete_spk(&mut self, owner: i64, spk_id: u32) -> Result<()>;

    /// Next one-time-prekey id; monotonic per user, never reused.
    fn next_opk_id(&mut self, owner: i64) -> Result<u32>;

    /// Insert a one-time prekey.
    fn store_opk(&mut self, owner: i64, opk_id: u32, keypair: &DhKeyPair<C>) -> Result<()>;

    /// Atomic read-then-delete of a one-time prekey.
    fn consume_opk(&mut self, owner: i64, opk_id: u32) -> Result<DhKeyPair<C>>;

    /// Remove a batch of one-time prekeys (compensation path).
    fn delete_opks(&mut self, owner: i64, opk_ids: &[u32]) -> Result<()>;

    /// Number of one-time prekeys still on hand.
    fn opk_count(&mut self, owner: i64) -> Result<usize>;

    /// Upsert a peer device. Idempotent for a matching identity key;
    /// a different key for a known device is a conflict.
    fn store_peer(&mut self, device_id: &str, ik: &SignaturePublicKey<C>) -> Result<i64>;

    /// Look up a peer row id without creating one.
    fn find_peer(&mut self, device_id: &str) -> Result<Option<i64>>;

    /// Insert or update a session blob and mark it the active session for
    /// its peer; other sessions for the same peer go stale. Returns the
    /// row id.
    fn save_session(
        &mut self,
        owner: i64,
        peer_did: i64,
        session_id: Option<u64>,
        blob: &[u8],
    ) -> Result<u64>;

    /// Sessions for a peer, most-recently-active first.
    fn load_sessions_for(&mut self, owner: i64, peer_did: i64) -> Result<Vec<SessionRow>>;

    /// Make the transaction's writes visible.
    fn commit(self: Box<Self>) -> Result<()>;
}

// ── in-memory implementation ─────────────────────────────────────────────

#[derive(Clone)]
struct SelfRow<C: CurveSuite> {
    uid: i64,
    identity: SignatureKeyPair<C>,
    server_url: String,
    next_spk_id: u32,
    next_opk_id: u32,
}

#[derive(Clone)]
struct SpkRow<C: CurveSuite> {
    owner: i64,
    spk_id: u32,
    keypair: DhKeyPair<C>,
    active: bool,
    created_at: SystemTime,
    deactivated_at: Option<SystemTime>,
}

#[derive(Clone)]
struct OpkRow<C: CurveSuite> {
    owner: i64,
    opk_id: u32,
    keypair: DhKeyPair<C>,
}

#[derive(Clone)]
struct PeerRow {
    did: i64,
    device_id: String,
    ik: Vec<u8>,
}

#[derive(Clone)]
struct SessionDbRow {
    id: u64,
    owner: i64,
    peer_did: i64,
    blob: Vec<u8>,
    stale: bool,
    seq: u64,
}

#[derive(Clone)]
struct Tables<C: CurveSuite> {
    selves: HashMap<String, SelfRow<C>>,
    next_uid: i64,
    spks: Vec<SpkRow<C>>,
    opks: Vec<OpkRow<C>>,
    peers: Vec<PeerRow>,
    next_did: i64,
    sessions: Vec<SessionDbRow>,
    next_session_id: u64,
    next_seq: u64,
}

impl<C: CurveSuite> Default for Tables<C> {
    fn default() -> Self {
        Self {
            selves: HashMap::new(),
            next_uid: 1,
            spks: Vec::new(),
            opks: Vec::new(),
            peers: Vec::new(),
            next_did: 1,
            sessions: Vec::new(),
            next_session_id: 1,
            next_seq: 1,
        }
    }
}

/// In-memory store with snapshot-rollback transactions.
pub struct MemoryStorage<C: CurveSuite> {
    tables: Mutex<Tables<C>>,
}

impl<C: CurveSuite> MemoryStorage<C> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl<C: CurveSuite> Default for MemoryStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CurveSuite> std::fmt::Debug for MemoryStorage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

impl<C: CurveSuite> Storage<C> for MemoryStorage<C> {
    fn transaction<'a>(&'a self) -> Result<Box<dyn StorageTx<C> + 'a>> {
        let guard = self
            .tables
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))?;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

struct MemoryTx<'a, C: CurveSuite> {
    guard: MutexGuard<'a, Tables<C>>,
    /// Restored on drop unless the transaction committed
    snapshot: Option<Tables<C>>,
}

impl<C: CurveSuite> MemoryTx<'_, C> {
    fn self_row_mut(&mut self, owner: i64) -> Result<&mut SelfRow<C>> {
        self.guard
            .selves
            .values_mut()
            .find(|row| row.uid == owner)
            .ok_or_else(|| Error::Storage(format!("no user with uid {owner}")))
    }
}

impl<C: CurveSuite> Drop for MemoryTx<'_, C> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

impl<C: CurveSuite> StorageTx<C> for MemoryTx<'_, C> {
    fn store_self(
        &mut self,
        device_id: &str,
        identity: &SignatureKeyPair<C>,
        server_url: &str,
    ) -> Result<i64> {
        if self.guard.selves.contains_key(device_id) {
            return Err(Error::Storage(format!("user {device_id} already exists")));
        }
        let uid = self.guard.next_uid;
        self.guard.next_uid += 1;
        self.guard.selves.insert(
            device_id.to_string(),
            SelfRow {
                uid,
                identity: identity.clone(),
                server_url: server_url.to_string(),
                next_spk_id: 1,
                next_opk_id: 1,
            },
        );
        Ok(uid)
    }

    fn load_self(&mut self, device_id: &str) -> Result<SelfUser<C>> {
        let row = self
            .guard
            .selves
            .get(device_id)
            .ok_or_else(|| Error::Storage(format!("no user {device_id}")))?;
        Ok(SelfUser {
            uid: row.uid,
            identity: row.identity.clone(),
            server_url: row.server_url.clone(),
        })
    }

    fn delete_self(&mut self, device_id: &str) -> Result<()> {
        let row = self
            .guard
            .selves
            .remove(device_id)
            .ok_or_else(|| Error::Storage(format!("no user {device_id}")))?;
        let uid = row.uid;
        self.guard.spks.retain(|spk| spk.owner != uid);
        self.guard.opks.retain(|opk| opk.owner != uid);
        self.guard.sessions.retain(|session| session.owner != uid);
        Ok(())
    }

    fn next_spk_id(&mut self, owner: i64) -> Result<u32> {
        let row = self.self_row_mut(owner)?;
        let id = row.next_spk_id;
        row.next_spk_id += 1;
        Ok(id)
    }

    fn store_spk(&mut self, owner: i64, spk_id: u32, keypair: &DhKeyPair<C>) -> Result<()> {
        self.guard.spks.push(SpkRow {
            owner,
            spk_id,
            keypair: keypair.clone(),
            active: true,
            created_at: SystemTime::now(),
            deactivated_at: None,
        });
        Ok(())
    }

    fn load_spk(&mut self, owner: i64, spk_id: u32) -> Result<DhKeyPair<C>> {
        self.guard
            .spks
            .iter()
            .find(|spk| spk.owner == owner && spk.spk_id == spk_id)
            .map(|spk| spk.keypair.clone())
            .ok_or(Error::SpkNotFound(spk_id))
    }

    fn active_spk(&mut self, owner: i64) -> Result<Option<SpkRecord<C>>> {
        Ok(self
            .guard
            .spks
            .iter()
            .filter(|spk| spk.owner == owner && spk.active)
            .max_by_key(|spk| spk.spk_id)
            .map(|spk| SpkRecord {
                spk_id: spk.spk_id,
                keypair: spk.keypair.clone(),
                active: spk.active,
                created_at: spk.created_at,
            }))
    }

    fn deactivate_older_spks(&mut self, owner: i64, keep_spk_id: u32) -> Result<()> {
        let now = SystemTime::now();
        for spk in self
            .guard
            .spks
            .iter_mut()
            .filter(|spk| spk.owner == owner && spk.spk_id != keep_spk_id && spk.active)
        {
            spk.active = false;
            spk.deactivated_at = Some(now);
        }
        Ok(())
    }

    fn purge_spks_deactivated_before(&mut self, owner: i64, cutoff: SystemTime) -> Result<usize> {
        let before = self.guard.spks.len();
        self.guard.spks.retain(|spk| {
            spk.owner != owner
                || spk.active
                || spk.deactivated_at.map_or(true, |at| at >= cutoff)
        });
        Ok(before - self.guard.spks.len())
    }

    fn delete_spk(&mut self, owner: i64, spk_id: u32) -> Result<()> {
        self.guard
            .spks
            .retain(|spk| spk.owner != owner || spk.spk_id != spk_id);
        Ok(())
    }

    fn next_opk_id(&mut self, owner: i64) -> Result<u32> {
        let row = self.self_row_mut(owner)?;
        let id = row.next_opk_id;
        row.next_opk_id += 1;
        Ok(id)
    }

    fn store_opk(&mut self, owner: i64, opk_id: u32, keypair: &DhKeyPair<C>) -> Result<()> {
        self.guard.opks.push(OpkRow {
            owner,
            opk_id,
            keypair: keypair.clone(),
        });
        Ok(())
    }

    fn consume_opk(&mut self, owner: i64, opk_id: u32) -> Result<DhKeyPair<C>> {
        let index = self
            .guard
            .opks
            .iter()
            .position(|opk| opk.owner == owner && opk.opk_id == opk_id)
            .ok_or(Error::OpkNotFound(opk_id))?;
        Ok(self.guard.opks.swap_remove(index).keypair)
    }

    fn delete_opks(&mut self, owner: i64, opk_ids: &[u32]) -> Result<()> {
        self.guard
            .opks
            .retain(|opk| opk.owner != owner || !opk_ids.contains(&opk.opk_id));
        Ok(())
    }

    fn opk_count(&mut self, owner: i64) -> Result<usize> {
        Ok(self
            .guard
            .opks
            .iter()
            .filter(|opk| opk.owner == owner)
            .count())
    }

    fn store_peer(&mut self, device_id: &str, ik: &SignaturePublicKey<C>) -> Result<i64> {
        if let Some(peer) = self
            .guard
            .peers
            .iter()
            .find(|peer| peer.device_id == device_id)
        {
            return if constant_time_eq(&peer.ik, ik.as_bytes()) {
                Ok(peer.did)
            } else {
                Err(Error::PeerIdentityConflict {
                    device_id: device_id.to_string(),
                })
            };
        }
        let did = self.guard.next_did;
        self.guard.next_did += 1;
        self.guard.peers.push(PeerRow {
            did,
            device_id: device_id.to_string(),
            ik: ik.as_bytes().to_vec(),
        });
        Ok(did)
    }

    fn find_peer(&mut self, device_id: &str) -> Result<Option<i64>> {
        Ok(self
            .guard
            .peers
            .iter()
            .find(|peer| peer.device_id == device_id)
            .map(|peer| peer.did))
    }

    fn save_session(
        &mut self,
        owner: i64,
        peer_did: i64,
        session_id: Option<u64>,
        blob: &[u8],
    ) -> Result<u64> {
        let seq = self.guard.next_seq;
        self.guard.next_seq += 1;

        let id = match session_id {
            Some(id) => {
                let row = self
                    .guard
                    .sessions
                    .iter_mut()
                    .find(|session| session.id == id && session.owner == owner)
                    .ok_or_else(|| Error::Storage(format!("no session {id}")))?;
                row.blob = blob.to_vec();
                row.stale = false;
                row.seq = seq;
                id
            }
            None => {
                let id = self.guard.next_session_id;
                self.guard.next_session_id += 1;
                self.guard.sessions.push(SessionDbRow {
                    id,
                    owner,
                    peer_did,
                    blob: blob.to_vec(),
                    stale: false,
                    seq,
                });
                id
            }
        };

        for session in self
            .guard
            .sessions
            .iter_mut()
            .filter(|session| {
                session.owner == owner && session.peer_did == peer_did && session.id != id
            })
        {
            session.stale = true;
        }
        Ok(id)
    }

    fn load_sessions_for(&mut self, owner: i64, peer_did: i64) -> Result<Vec<SessionRow>> {
        let mut rows: Vec<_> = self
            .guard
            .sessions
            .iter()
            .filter(|session| session.owner == owner && session.peer_did == peer_did)
            .collect();
        rows.sort_by_key(|session| (session.stale, std::cmp::Reverse(session.seq)));
        Ok(rows
            .into_iter()
            .map(|session| SessionRow {
                id: session.id,
                blob: session.blob.clone(),
                stale: session.stale,
            })
            .collect())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Curve25519;
    use rand_core::OsRng;

    type C = Curve25519;

    fn new_user(storage: &MemoryStorage<C>) -> (i64, SignatureKeyPair<C>) {
        let identity = SignatureKeyPair::generate(&mut OsRng);
        let mut tx = storage.transaction().unwrap();
        let uid = tx
            .store_self("alice@example.org", &identity, "https://x3dh.example.org")
            .unwrap();
        tx.commit().unwrap();
        (uid, identity)
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let storage = MemoryStorage::<C>::new();
        let (uid, _) = new_user(&storage);

        {
            let mut tx = storage.transaction().unwrap();
            let opk = DhKeyPair::generate(&mut OsRng);
            tx.store_opk(uid, 1, &opk).unwrap();
            // no commit
        }

        let mut tx = storage.transaction().unwrap();
        assert_eq!(tx.opk_count(uid).unwrap(), 0);
    }

    #[test]
    fn consume_opk_is_read_then_delete() {
        let storage = MemoryStorage::<C>::new();
        let (uid, _) = new_user(&storage);

        let mut tx = storage.transaction().unwrap();
        let opk = DhKeyPair::generate(&mut OsRng);
        tx.store_opk(uid, 5, &opk).unwrap();
        let consumed = tx.consume_opk(uid, 5).unwrap();
        assert_eq!(consumed.public(), opk.public());
        assert_eq!(tx.consume_opk(uid, 5).unwrap_err(), Error::OpkNotFound(5));
        tx.commit().unwrap();
    }

    #[test]
    fn prekey_ids_are_monotonic() {
        let storage = MemoryStorage::<C>::new();
        let (uid, _) = new_user(&storage);

        let mut tx = storage.transaction().unwrap();
        let a = tx.next_spk_id(uid).unwrap();
        let b = tx.next_spk_id(uid).unwrap();
        assert!(b > a);
        tx.commit().unwrap();

        // ids survive the transaction boundary
        let mut tx = storage.transaction().unwrap();
        let c = tx.next_spk_id(uid).unwrap();
        assert!(c > b);
    }

    #[test]
    fn peer_upsert_is_idempotent_and_conflict_checked() {
        let storage = MemoryStorage::<C>::new();
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);
        let mallory = SignatureKeyPair::<C>::generate(&mut OsRng);

        let mut tx = storage.transaction().unwrap();
        let did = tx.store_peer("bob", bob.public()).unwrap();
        assert_eq!(tx.store_peer("bob", bob.public()).unwrap(), did);
        assert!(matches!(
            tx.store_peer("bob", mallory.public()).unwrap_err(),
            Error::PeerIdentityConflict { .. }
        ));
    }

    #[test]
    fn sessions_order_mru_and_mark_stale() {
        let storage = MemoryStorage::<C>::new();
        let (uid, _) = new_user(&storage);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);

        let mut tx = storage.transaction().unwrap();
        let did = tx.store_peer("bob", bob.public()).unwrap();
        let first = tx.save_session(uid, did, None, b"one").unwrap();
        let second = tx.save_session(uid, did, None, b"two").unwrap();

        let rows = tx.load_sessions_for(uid, did).unwrap();
        assert_eq!(rows[0].id, second);
        assert!(!rows[0].stale);
        assert_eq!(rows[1].id, first);
        assert!(rows[1].stale);

        // re-activating the first flips the ordering back
        tx.save_session(uid, did, Some(first), b"one'").unwrap();
        let rows = tx.load_sessions_for(uid, did).unwrap();
        assert_eq!(rows[0].id, first);
        assert!(rows[1].stale);
    }

    #[test]
    fn delete_self_cascades() {
        let storage = MemoryStorage::<C>::new();
        let (uid, _) = new_user(&storage);
        let bob = SignatureKeyPair::<C>::generate(&mut OsRng);

        let mut tx = storage.transaction().unwrap();
        let spk = DhKeyPair::generate(&mut OsRng);
        tx.store_spk(uid, 1, &spk).unwrap();
        tx.store_opk(uid, 1, &spk).unwrap();
        let did = tx.store_peer("bob", bob.public()).unwrap();
        tx.save_session(uid, did, None, b"blob").unwrap();
        tx.commit().unwrap();

        let mut tx = storage.transaction().unwrap();
        tx.delete_self("alice@example.org").unwrap();
        assert_eq!(tx.opk_count(uid).unwrap(), 0);
        assert!(tx.load_sessions_for(uid, did).unwrap().is_empty());
        assert_eq!(tx.load_spk(uid, 1).unwrap_err(), Error::SpkNotFound(1));
        tx.commit().unwrap();
    }

    #[test]
    fn spk_rotation_grace_and_purge() {
        let storage = MemoryStorage::<C>::new();
        let (uid, _) = new_user(&storage);

        let mut tx = storage.transaction().unwrap();
        let old = DhKeyPair::generate(&mut OsRng);
        let new = DhKeyPair::generate(&mut OsRng);
        tx.store_spk(uid, 1, &old).unwrap();
        tx.store_spk(uid, 2, &new).unwrap();
        tx.deactivate_older_spks(uid, 2).unwrap();

        // deactivated but still loadable during grace
        assert!(tx.load_spk(uid, 1).is_ok());
        assert_eq!(tx.active_spk(uid).unwrap().unwrap().spk_id, 2);

        // purge everything deactivated before a future cutoff
        let cutoff = SystemTime::now() + std::time::Duration::from_secs(60);
        assert_eq!(tx.purge_spks_deactivated_before(uid, cutoff).unwrap(), 1);
        assert_eq!(tx.load_spk(uid, 1).unwrap_err(), Error::SpkNotFound(1));
        assert!(tx.load_spk(uid, 2).is_ok());
    }
}
