//! Events a Port Manager publishes on its broadcast channel (§4.1), replacing
//! the event-emitter-inheritance design the specification flags in §9 with
//! explicit typed variants.

use crate::port_manager::status::Status;
use crate::request::DeviceId;

#[derive(Debug, Clone)]
pub enum PortManagerEvent {
    /// Fired once, edge-triggered, on every status transition. Always
    /// precedes whichever semantic event the transition also causes.
    StatusChanged {
        code: i8,
        label: &'static str,
        message: Option<String>,
    },
    /// The transport finished opening.
    Open,
    /// Identification succeeded and `deviceId` was previously unset.
    Ready { id: DeviceId },
    /// Identification succeeded and reported the same id as before.
    Reinitialized { id: DeviceId },
    /// Identification succeeded and reported a different id than before.
    IdChange { id: DeviceId },
    /// The transport disconnected. Carries the last known device id, if any
    /// had been established before the disconnect.
    Disconnect { id: Option<DeviceId> },
    /// The transport was closed.
    Close,
    /// The transport reported an error.
    Error { message: String },
}

impl PortManagerEvent {
    pub(crate) fn status_changed(status: Status, message: Option<String>) -> Self {
        PortManagerEvent::StatusChanged {
            code: status.code(),
            label: status.label(),
            message,
        }
    }
}
