//! The Option Policy external collaborator (§6) and the per-port
//! configuration it produces (§3).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::request::DeviceId;

/// Library default for `maxQueueLength` when a policy does not set one.
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 30;

/// Library default for `serialResponseTimeout` when a policy does not set one.
pub const DEFAULT_SERIAL_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Port metadata as reported by enumeration. Fields the platform or the
/// transport library did not supply are `None`, never a sentinel value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
}

/// Pure function turning a raw identification response into a device
/// identity, or `None` on a response the parser cannot make sense of.
pub type IdResponseParser = Arc<dyn Fn(&[u8]) -> Option<DeviceId> + Send + Sync>;

/// Pure predicate validating a raw response buffer at quiescence.
pub type ResponseCheck = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Per-port configuration produced by an [`OptionPolicy`] for a port it has
/// decided to accept.
///
/// Defaults are applied first by [`PortConfigBuilder`], then overridden by
/// whatever the policy sets explicitly. The transport is always opened with a
/// raw byte parser; that is enforced by the transport layer and is therefore
/// not a field here at all (§3: "transport-enforced fields ... override").
#[derive(Clone)]
pub struct PortConfig {
    pub baud_rate: u32,
    pub get_id_command: Vec<u8>,
    pub get_id_response_parser: IdResponseParser,
    pub check_response: Option<ResponseCheck>,
    pub max_queue_length: usize,
    pub serial_response_timeout: Duration,
}

impl fmt::Debug for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortConfig")
            .field("baud_rate", &self.baud_rate)
            .field("get_id_command", &self.get_id_command)
            .field("check_response", &self.check_response.is_some())
            .field("max_queue_length", &self.max_queue_length)
            .field("serial_response_timeout", &self.serial_response_timeout)
            .finish()
    }
}

/// Builder for [`PortConfig`], in the "defaults first, then explicit setters"
/// style used throughout this crate's ambient configuration plumbing.
pub struct PortConfigBuilder {
    config: PortConfig,
}

impl PortConfigBuilder {
    /// Start building with the library's defaults and the two fields every
    /// policy must supply: the baud rate and the identification probe.
    pub fn new(baud_rate: u32, get_id_command: impl Into<Vec<u8>>, get_id_response_parser: IdResponseParser) -> Self {
        PortConfigBuilder {
            config: PortConfig {
                baud_rate,
                get_id_command: get_id_command.into(),
                get_id_response_parser,
                check_response: None,
                max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
                serial_response_timeout: DEFAULT_SERIAL_RESPONSE_TIMEOUT,
            },
        }
    }

    pub fn check_response(mut self, check: ResponseCheck) -> Self {
        self.config.check_response = Some(check);
        self
    }

    pub fn max_queue_length(mut self, max_queue_length: usize) -> Self {
        self.config.max_queue_length = max_queue_length;
        self
    }

    pub fn serial_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial_response_timeout = timeout;
        self
    }

    pub fn finalize(self) -> PortConfig {
        self.config
    }
}

/// The result of evaluating a port against an [`OptionPolicy`]: either the
/// port is outside the policy's interest, or it is accepted with a concrete
/// configuration.
pub enum OptionOutcome {
    Ignore,
    Accept(PortConfig),
}

/// Caller-supplied collaborator deciding which ports this fleet manages and
/// how. Re-invoked on every reconnect for the same path, so metadata that
/// changes across a replug (e.g. a serial number becoming readable) takes
/// effect on the next open.
pub trait OptionPolicy: Send + Sync {
    fn evaluate(&self, port: &PortInfo) -> OptionOutcome;
}

/// Convenience [`OptionPolicy`] built from a plain closure.
pub struct FnOptionPolicy<F>(F)
where
    F: Fn(&PortInfo) -> OptionOutcome + Send + Sync;

impl<F> FnOptionPolicy<F>
where
    F: Fn(&PortInfo) -> OptionOutcome + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnOptionPolicy(f)
    }
}

impl<F> OptionPolicy for FnOptionPolicy<F>
where
    F: Fn(&PortInfo) -> OptionOutcome + Send + Sync,
{
    fn evaluate(&self, port: &PortInfo) -> OptionOutcome {
        (self.0)(port)
    }
}
