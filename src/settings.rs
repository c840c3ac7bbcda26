//! Configuration constants and per-device tunables.

use std::time::Duration;

/// HKDF info string for the X3DH session key derivation.
/// Stable across versions; changing it breaks interop.
pub const X3DH_SK_INFO: &[u8] = b"x3dh-messaging session key";

/// HKDF info string for the X3DH associated-data derivation.
/// Stable across versions; changing it breaks interop.
pub const X3DH_AD_INFO: &[u8] = b"x3dh-messaging associated data";

/// Content type of every directory exchange
pub const CONTENT_TYPE: &str = "x3dh/octet-stream";

/// Per-device tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// One-time prekeys generated per replenishment batch; governs the
    /// steady-state pool size on the directory.
    pub opk_batch_count: u16,
    /// Ratchet bound on missed messages before a chain becomes
    /// unrecoverable
    pub max_message_skip: u32,
    /// Age at which the active signed prekey is rotated
    pub spk_lifetime: Duration,
    /// Grace period before a rotated signed prekey is purged; handshakes
    /// referencing it keep working until then.
    pub spk_keep_after_rotation: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            opk_batch_count: 25,
            max_message_skip: 1024,
            spk_lifetime: Duration::from_secs(7 * 24 * 3600),
            spk_keep_after_rotation: Duration::from_secs(30 * 24 * 3600),
        }
    }
}
