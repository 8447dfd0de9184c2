//! Events the Device Manager publishes on its broadcast channel (§4.2),
//! derived from the Port Managers it supervises.

use crate::request::DeviceId;

#[derive(Debug, Clone)]
pub enum DeviceManagerEvent {
    /// `id` was identified for the first time anywhere in the fleet.
    New { id: DeviceId },
    /// `id` became reachable again (after a reconnect, or a same-session
    /// reinitialization).
    Connect { id: DeviceId },
    /// `id`'s owning Port Manager reported the transport gone.
    Disconnect { id: DeviceId },
}
