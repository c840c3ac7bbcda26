//! Directory transport contract.
//!
//! The core never talks to the network itself. It hands a
//! [`DirectoryRequest`] plus a [`DirectoryResponder`] to whatever
//! transport the application supplies; the transport delivers the
//! server's reply through the responder whenever it arrives.
//!
//! The responder holds only a weak reference to the owning device. If
//! the device is gone by the time the reply lands, resolving is a no-op
//! and queued work on that device has already completed with
//! `cancelled` — transports never keep a device alive and never touch a
//! dead one.

use crate::curve::CurveSuite;
use crate::device::{handle_response, DeviceInner, ResponseContext};
use crate::settings::CONTENT_TYPE;
use std::sync::{Mutex, Weak};
use tracing::debug;

/// One request to the directory server.
///
/// Maps one-to-one onto an HTTP POST: `url` is the target, `from` goes
/// into the `From` header (the authenticated sender device id), and
/// `content_type` is always [`CONTENT_TYPE`].
#[derive(Debug, Clone)]
pub struct DirectoryRequest {
    /// Directory server URL
    pub url: String,
    /// Sender device id, conveyed as the `From` header
    pub from: String,
    /// Body content type
    pub content_type: &'static str,
    /// Framed protocol message
    pub body: Vec<u8>,
}

impl DirectoryRequest {
    pub(crate) fn new(url: &str, from: &str, body: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            from: from.to_string(),
            content_type: CONTENT_TYPE,
            body,
        }
    }
}

/// Completion handle for one in-flight request.
pub struct DirectoryResponder<C: CurveSuite> {
    pub(crate) device: Weak<Mutex<DeviceInner<C>>>,
    pub(crate) context: ResponseContext,
}

impl<C: CurveSuite> DirectoryResponder<C> {
    /// Deliver the server's response.
    ///
    /// `status` is the transport status code (200 for success); `body` is
    /// the raw response body. Consumes the responder: each request
    /// resolves exactly once.
    pub fn resolve(self, status: u16, body: Vec<u8>) {
        match self.device.upgrade() {
            Some(device) => handle_response(&device, self.context, status, body),
            None => {
                debug!("directory response arrived after device teardown, dropping");
            }
        }
    }
}

impl<C: CurveSuite> std::fmt::Debug for DirectoryResponder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryResponder")
            .field("context", &self.context)
            .finish()
    }
}

/// Request/response channel to the directory server.
///
/// Implementations may resolve the responder synchronously from inside
/// `post` (an in-process server) or from another thread later (a real
/// HTTP client); the device never holds its own lock across this call.
pub trait DirectoryTransport<C: CurveSuite>: Send + Sync {
    /// Send one request; deliver the reply through `responder`.
    fn post(&self, request: DirectoryRequest, responder: DirectoryResponder<C>);
}
