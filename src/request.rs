//! The internal queue entry (§3 "Request") and the identity type requests are
//! keyed by.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::RequestError;

/// A stable string produced by a device itself in response to the
/// identification probe; the key under which callers address a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_owned())
    }
}

/// Options a caller may pass to [`crate::PortManagerHandle::submit`] or
/// [`crate::DeviceManager::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Per-request quiescence window. Defaults to the port's
    /// `serialResponseTimeout` when `None`.
    pub timeout: Option<Duration>,
}

/// A queued command awaiting its turn at the head of a Port Manager's single
/// consumer queue.
///
/// `capture_device_id` is the identity observed at enqueue time; it is `None`
/// for the identification probe, which is exempt from the admission gate and
/// from stale-identity invalidation.
pub(crate) struct Request {
    pub command: Vec<u8>,
    pub timeout: Option<Duration>,
    pub capture_device_id: Option<DeviceId>,
    pub resolver: oneshot::Sender<Result<String, RequestError>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("command_len", &self.command.len())
            .field("timeout", &self.timeout)
            .field("capture_device_id", &self.capture_device_id)
            .finish()
    }
}
