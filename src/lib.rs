//! # X3DH messaging core
//!
//! The cryptographic core of an end-to-end encrypted messaging library:
//! X3DH key agreement layered under Double Ratchet sessions, with the
//! binary protocol for a prekey directory server, the transactional
//! local-store contracts, and a per-device dispatcher that fans one
//! plaintext out to any number of recipient devices.
//!
//! ## Security Properties
//!
//! - **Forward secrecy**: past messages stay sealed if long-term keys leak
//! - **Post-compromise security**: sessions heal as the DH ratchet turns
//! - **Asynchronous establishment**: senders encrypt from published key
//!   bundles without the recipient ever being online
//!
//! ## Shape
//!
//! A [`Device`] is one installed user: it owns its identity key, its
//! store, its session cache, and its encryption queue. The directory
//! server and the persistence engine are collaborators behind
//! [`DirectoryTransport`] and [`storage::Storage`]; in-process
//! implementations ship for the store ([`storage::MemoryStorage`]) and
//! the protocol has both build and parse directions so a directory
//! server can be stood up from this crate alone.
//!
//! All key sizes follow the [`CurveSuite`] the device is instantiated
//! with; the shipped suite is [`Curve25519`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//! use x3dh_messaging::{
//!     storage::MemoryStorage, CallbackStatus, Curve25519, Device, RecipientData, Settings,
//! };
//! # fn transport() -> Arc<dyn x3dh_messaging::DirectoryTransport<Curve25519>> { unimplemented!() }
//!
//! let storage = Arc::new(MemoryStorage::<Curve25519>::new());
//! let device = Device::create_user(
//!     "alice@example.org;device=1",
//!     "https://x3dh.example.org",
//!     storage,
//!     transport(),
//!     Settings::default(),
//!     |status, note| assert_eq!(status, CallbackStatus::Success, "{note}"),
//! )
//! .unwrap();
//!
//! let recipients = Arc::new(Mutex::new(vec![RecipientData::new("bob@example.org;device=1")]));
//! let cipher_message = Arc::new(Mutex::new(Vec::new()));
//! device.encrypt(
//!     "bob@example.org",
//!     recipients.clone(),
//!     b"hello",
//!     cipher_message.clone(),
//!     |status, _| assert_eq!(status, CallbackStatus::Success),
//! );
//! ```

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all)]

pub mod crypto;
pub mod curve;
pub mod device;
pub mod double_ratchet;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod settings;
pub mod storage;
pub mod transport;
pub mod x3dh;

// Re-export main types
pub use curve::{Curve25519, CurveId, CurveSuite};
pub use device::{CallbackStatus, Device, RecipientData, RecipientStatus};
pub use double_ratchet::{RatchetMessage, RatchetSession};
pub use error::{Error, Result};
pub use keys::{DhKeyPair, DhPublicKey, SignatureKeyPair, SignaturePublicKey};
pub use settings::Settings;
pub use transport::{DirectoryRequest, DirectoryResponder, DirectoryTransport};
pub use x3dh::PeerBundle;
