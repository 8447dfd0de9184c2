//! Error taxonomy surfaced to callers (§7) and the internal reasons that drive
//! the reconnect state machine without ever reaching a caller's future.

use thiserror::Error;

use crate::request::DeviceId;

/// Errors a single [`crate::PortManagerHandle::submit`] can fail with.
///
/// These are exactly the caller-facing kinds from the error taxonomy; the
/// internal kinds (`InitFailed`, `PortAbsent`) are never wrapped in this type
/// because they resolve no pending caller future — they only drive
/// `statusChanged`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Non-probe submission while the port is not `Ready`.
    #[error("port is not ready to accept requests")]
    NotReady,
    /// Admission attempted beyond `maxQueueLength` (strict `>`, see §4.1).
    #[error("request queue is full")]
    QueueFull,
    /// The head request's captured device id no longer matches the current one.
    #[error("device identity changed while the request was queued")]
    StaleIdentity,
    /// The transport's write callback reported an error.
    #[error("write to the serial transport failed: {0}")]
    WriteFailed(String),
    /// `checkResponse` rejected the buffer at quiescence.
    #[error("response failed validation")]
    ValidationFailed,
}

/// Errors from [`crate::DeviceManager::request`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No Port Manager claimed this device id before the discovery deadline.
    #[error("no device with id {0} was found within the discovery deadline")]
    DeviceNotFound(DeviceId),
    /// The resolved Port Manager rejected the request itself.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Internal-only reasons a connected session ended and the reconnect loop
/// should run again. Never surfaced to a caller; observable only through
/// [`crate::port_manager::PortManagerEvent::StatusChanged`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The transport reported an error notification.
    TransportError(String),
    /// The transport reported the device was unplugged.
    Disconnected,
    /// The transport was closed, either by itself or after a write failure.
    Closed,
}
