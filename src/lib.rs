//! Reliable request/response access to a fleet of serial-attached devices
//! that appear, disappear and get replugged at will.
//!
//! A [`DeviceManager`] owns a set of [`port_manager`]s, one per OS-level
//! serial path. Each Port Manager runs its own reconnection loop: wait for
//! its path to reappear, open it, identify whatever is plugged in by probing
//! it with a caller-supplied command, then serve a bounded FIFO queue of
//! requests until the transport disappears again. The Device Manager tracks
//! which device id currently lives behind which path, so callers address
//! devices by identity and do not need to know or care which path they are
//! plugged into right now.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serial_fleet::{DeviceManager, DeviceManagerOptions, FnOptionPolicy, OptionOutcome, PortConfigBuilder, RequestOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = Arc::new(FnOptionPolicy::new(|port| {
//!     OptionOutcome::Accept(
//!         PortConfigBuilder::new(9600, b"!SHOW HOST_NAME\n".to_vec(), Arc::new(|buf: &[u8]| {
//!             String::from_utf8_lossy(buf)
//!                 .strip_prefix("Host Name = ")
//!                 .map(|name| name.trim_end().into())
//!         }))
//!         .finalize(),
//!     )
//! }));
//!
//! let manager = DeviceManager::new(policy, DeviceManagerOptions::default());
//! manager.refresh().await;
//! let response = manager.request("blaster_test_epfl", b"!SHOW HOST_NAME\n".to_vec(), RequestOptions::default()).await?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```

pub mod device_manager;
pub mod error;
pub mod policy;
pub mod port_manager;
pub mod request;
pub mod transport;

pub use device_manager::{DeviceManager, DeviceManagerEvent, DeviceManagerOptions, DEFAULT_DISCOVERY_TIMEOUT};
pub use error::{DeviceError, RequestError};
pub use policy::{
    FnOptionPolicy, IdResponseParser, OptionOutcome, OptionPolicy, PortConfig, PortConfigBuilder, PortInfo, ResponseCheck,
    DEFAULT_MAX_QUEUE_LENGTH, DEFAULT_SERIAL_RESPONSE_TIMEOUT,
};
pub use port_manager::{spawn as spawn_port_manager, PortManagerEvent, PortManagerHandle, Status};
pub use request::{DeviceId, RequestOptions};
pub use transport::{PortEnumerator, RealPortEnumerator, RealTransportFactory, TransportEvent, TransportFactory, TransportHandle};
