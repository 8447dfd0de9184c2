//! The Device Manager (§4.2): the fleet-facing façade that turns a set of
//! serial ports into a set of addressable devices, re-identifying them
//! across replugs and reassigned paths.

pub mod events;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

pub use events::DeviceManagerEvent;

use crate::error::DeviceError;
use crate::policy::OptionPolicy;
use crate::request::{DeviceId, RequestOptions};
use crate::transport::{PortEnumerator, RealPortEnumerator, RealTransportFactory, TransportFactory};
use registry::Registry;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Library default for how long [`DeviceManager::request`] waits for a
/// device id it does not yet recognize before giving up.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables that apply to the fleet as a whole rather than to any one port.
#[derive(Debug, Clone)]
pub struct DeviceManagerOptions {
    pub discovery_timeout: Duration,
}

impl Default for DeviceManagerOptions {
    fn default() -> Self {
        DeviceManagerOptions {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

/// Supervises a fleet of serial-attached devices: which ports are managed,
/// which device ids they have most recently identified as, and how to reach
/// them by id rather than by path (§4.2).
pub struct DeviceManager {
    registry: Arc<Registry>,
    options: DeviceManagerOptions,
}

impl DeviceManager {
    /// Build a manager backed by real hardware (`serialport` enumeration and
    /// transports).
    pub fn new(policy: Arc<dyn OptionPolicy>, options: DeviceManagerOptions) -> Self {
        Self::with_collaborators(policy, Arc::new(RealPortEnumerator), Arc::new(RealTransportFactory), options)
    }

    pub(crate) fn with_collaborators(
        policy: Arc<dyn OptionPolicy>,
        enumerator: Arc<dyn PortEnumerator>,
        transport_factory: Arc<dyn TransportFactory>,
        options: DeviceManagerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        DeviceManager {
            registry: Arc::new(Registry::new(policy, enumerator, transport_factory, events)),
            options,
        }
    }

    /// Run one enumeration pass, spawning a Port Manager for every
    /// currently-attached port this manager does not yet own. Concurrent
    /// callers share a single pass's completion (§4.2).
    pub async fn refresh(&self) {
        self.registry.refresh().await;
    }

    /// Send `command` to the device identified by `id`, waiting up to the
    /// configured discovery timeout if `id` has not been seen yet.
    pub async fn request(
        &self,
        id: impl Into<DeviceId>,
        command: impl Into<Vec<u8>>,
        opts: RequestOptions,
    ) -> Result<String, DeviceError> {
        let id = id.into();
        let handle = self
            .registry
            .resolve_or_wait(&id, self.options.discovery_timeout)
            .await
            .ok_or_else(|| DeviceError::DeviceNotFound(id.clone()))?;
        handle.submit(command, opts).await.map_err(DeviceError::from)
    }

    /// The device ids this manager currently recognizes, connected or not.
    pub async fn list_device_ids(&self) -> Vec<DeviceId> {
        self.registry.list_device_ids().await
    }

    /// Subscribe to fleet-wide `New`/`Connect`/`Disconnect` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceManagerEvent> {
        self.registry.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::policy::{FnOptionPolicy, IdResponseParser, OptionOutcome, PortConfigBuilder};
    use crate::port_manager::test_support::{FakeTransportFactory, StaticEnumerator};

    fn host_name_parser() -> IdResponseParser {
        Arc::new(|buf: &[u8]| {
            let text = String::from_utf8_lossy(buf);
            text.strip_prefix("Host Name = ")
                .map(|rest| DeviceId::new(rest.trim_end().to_owned()))
        })
    }

    fn policy() -> Arc<dyn OptionPolicy> {
        Arc::new(FnOptionPolicy::new(|_info| {
            OptionOutcome::Accept(PortConfigBuilder::new(9600, b"!SHOW HOST_NAME\n".to_vec(), host_name_parser()).finalize())
        }))
    }

    #[tokio::test]
    async fn refresh_discovers_ports_and_request_resolves_by_id() {
        let factory = Arc::new(FakeTransportFactory::new());
        factory.script_response("/dev/ttyA", b"Host Name = alpha\r\n".to_vec());
        factory.script_response("/dev/ttyB", b"Host Name = bravo\r\n".to_vec());

        let manager = DeviceManager::with_collaborators(
            policy(),
            Arc::new(StaticEnumerator::with_paths(&["/dev/ttyA", "/dev/ttyB"])),
            factory.clone(),
            DeviceManagerOptions::default(),
        );

        manager.refresh().await;

        // `request` waits out the discovery window itself, so it is immune
        // to the race between identification completing and a fresh
        // subscriber attaching.
        factory.script_response("/dev/ttyA", b"Host Name = alpha\r\n".to_vec());
        let response = manager.request("alpha", b"!SHOW HOST_NAME\n".to_vec(), RequestOptions::default()).await.unwrap();
        assert_eq!(response, "Host Name = alpha\r\n");

        factory.script_response("/dev/ttyB", b"Host Name = bravo\r\n".to_vec());
        let response = manager.request("bravo", b"!SHOW HOST_NAME\n".to_vec(), RequestOptions::default()).await.unwrap();
        assert_eq!(response, "Host Name = bravo\r\n");
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_enumeration_pass() {
        let factory = Arc::new(FakeTransportFactory::new());
        factory.script_response("/dev/ttyC", b"Host Name = charlie\r\n".to_vec());

        let manager = Arc::new(DeviceManager::with_collaborators(
            policy(),
            Arc::new(StaticEnumerator::with_path("/dev/ttyC")),
            factory,
            DeviceManagerOptions::default(),
        ));

        let a = manager.clone();
        let b = manager.clone();
        let (ra, rb) = tokio::join!(tokio::spawn(async move { a.refresh().await }), tokio::spawn(async move { b.refresh().await }));
        ra.unwrap();
        rb.unwrap();

        let mut events = manager.subscribe();
        let id = loop {
            if let DeviceManagerEvent::New { id } = events.recv().await.unwrap() {
                break id;
            }
        };
        assert_eq!(id.as_str(), "charlie");
    }

    #[tokio::test]
    async fn request_for_an_unknown_device_times_out_as_not_found() {
        let factory = Arc::new(FakeTransportFactory::new());
        let manager = DeviceManager::with_collaborators(
            policy(),
            Arc::new(StaticEnumerator::with_path("/dev/ttyD")),
            factory,
            DeviceManagerOptions {
                discovery_timeout: Duration::from_millis(30),
            },
        );

        let result = manager.request("ghost", b"PING".to_vec(), RequestOptions::default()).await;
        assert!(matches!(result, Err(DeviceError::DeviceNotFound(_))));
    }
}
