//! The per-port Port Manager (§4.1): a supervised pipeline owning one serial
//! port, split in the teacher's states/events/state-machine file-per-concern
//! convention.
//!
//! - [`status`] — the status state machine and its numeric codes.
//! - [`events`] — the typed events published on [`PortManagerHandle::subscribe`].
//! - [`queue`] — admission and the quiescence framer.
//! - [`reconnect`] — the reconnection loop, identification handshake, and the
//!   task body tying the above together.

pub mod events;
mod queue;
mod reconnect;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

pub use events::PortManagerEvent;
pub use status::Status;

use crate::error::RequestError;
use crate::policy::OptionPolicy;
use crate::request::RequestOptions;
use crate::transport::{PortEnumerator, TransportFactory};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Command sent from a [`PortManagerHandle`] to the task owning a port's
/// state.
pub(crate) enum PortManagerCommand {
    Submit {
        command: Vec<u8>,
        timeout: Option<Duration>,
        resolver: oneshot::Sender<Result<String, RequestError>>,
    },
}

/// A cheap, `Clone`-able handle to a running Port Manager. Exclusivity over
/// the manager's mutable state comes entirely from that state living in a
/// single task; the handle only ever talks to it over a channel (§5).
#[derive(Clone)]
pub struct PortManagerHandle {
    port_path: String,
    commands: mpsc::Sender<PortManagerCommand>,
    events: broadcast::Sender<PortManagerEvent>,
}

impl PortManagerHandle {
    /// The OS-level path this Port Manager owns. Immutable for the handle's
    /// lifetime (§3: `portPath` is immutable).
    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    /// Submit a command, returning a future that resolves when the response
    /// is framed (or the request fails per the error taxonomy in §7).
    pub async fn submit(&self, command: impl Into<Vec<u8>>, opts: RequestOptions) -> Result<String, RequestError> {
        let (resolver, receiver) = oneshot::channel();
        self.commands
            .send(PortManagerCommand::Submit {
                command: command.into(),
                timeout: opts.timeout,
                resolver,
            })
            .await
            .map_err(|_| RequestError::NotReady)?;
        receiver.await.map_err(|_| RequestError::NotReady)?
    }

    /// Subscribe to this Port Manager's event stream. Each subscriber gets
    /// its own receiver; events published before subscribing are missed, as
    /// is normal for a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<PortManagerEvent> {
        self.events.subscribe()
    }
}

/// Spawn a Port Manager task for `port_path` and return a handle to it. The
/// task runs for the remainder of the process, cycling through the
/// reconnection loop in §4.1 (§3: "it lives for the remainder of the
/// process").
pub fn spawn(
    port_path: String,
    policy: Arc<dyn OptionPolicy>,
    enumerator: Arc<dyn PortEnumerator>,
    transport_factory: Arc<dyn TransportFactory>,
) -> PortManagerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (evt_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let handle = PortManagerHandle {
        port_path: port_path.clone(),
        commands: cmd_tx,
        events: evt_tx.clone(),
    };

    tokio::spawn(reconnect::run(port_path, policy, enumerator, transport_factory, cmd_rx, evt_tx));

    handle
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::test_support::{FakeTransportFactory, StaticEnumerator};
    use super::*;
    use crate::policy::{FnOptionPolicy, IdResponseParser, OptionOutcome, PortConfigBuilder};
    use crate::request::DeviceId;

    fn host_name_parser() -> IdResponseParser {
        Arc::new(|buf: &[u8]| {
            let text = String::from_utf8_lossy(buf);
            text.strip_prefix("Host Name = ")
                .map(|rest| DeviceId::new(rest.trim_end().to_owned()))
        })
    }

    fn policy_for(baud: u32) -> Arc<dyn OptionPolicy> {
        Arc::new(FnOptionPolicy::new(move |_info| {
            OptionOutcome::Accept(
                PortConfigBuilder::new(baud, b"!SHOW HOST_NAME\n".to_vec(), host_name_parser()).finalize(),
            )
        }))
    }

    #[tokio::test]
    async fn happy_path_identifies_then_serves_a_request() {
        let factory = Arc::new(FakeTransportFactory::new());
        factory.script_response("/dev/ttyX", b"Host Name = blaster_test_epfl\r\n".to_vec());

        let handle = spawn(
            "/dev/ttyX".into(),
            policy_for(9600),
            Arc::new(StaticEnumerator::with_path("/dev/ttyX")),
            factory.clone(),
        );

        let mut events = handle.subscribe();
        let id = loop {
            match events.recv().await.unwrap() {
                PortManagerEvent::Ready { id } => break id,
                _ => continue,
            }
        };
        assert_eq!(id.as_str(), "blaster_test_epfl");

        factory.script_response("/dev/ttyX", b"Host Name = blaster_test_epfl\r\n".to_vec());
        let response = handle.submit(b"!SHOW HOST_NAME\n".to_vec(), RequestOptions::default()).await.unwrap();
        assert_eq!(response, "Host Name = blaster_test_epfl\r\n");
    }

    #[tokio::test]
    async fn quiescence_framing_waits_for_silence() {
        let factory = Arc::new(FakeTransportFactory::new());
        factory.script_response("/dev/ttyQ", b"Host Name = quiet\r\n".to_vec());

        let handle = spawn(
            "/dev/ttyQ".into(),
            policy_for(9600),
            Arc::new(StaticEnumerator::with_path("/dev/ttyQ")),
            factory.clone(),
        );
        let mut events = handle.subscribe();
        loop {
            if let PortManagerEvent::Ready { .. } = events.recv().await.unwrap() {
                break;
            }
        }

        factory.script_trickle("/dev/ttyQ", vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()], Duration::from_millis(100));
        let response = handle
            .submit(
                b"READ".to_vec(),
                RequestOptions {
                    timeout: Some(Duration::from_millis(200)),
                },
            )
            .await
            .unwrap();
        assert_eq!(response, "ABC");
    }

    #[tokio::test]
    async fn queue_overflow_rejects_beyond_strict_capacity() {
        let factory = Arc::new(FakeTransportFactory::new());
        factory.script_response("/dev/ttyF", b"Host Name = full\r\n".to_vec());
        let handle = spawn(
            "/dev/ttyF".into(),
            policy_for(9600),
            Arc::new(StaticEnumerator::with_path("/dev/ttyF")),
            factory.clone(),
        );
        let mut events = handle.subscribe();
        loop {
            if let PortManagerEvent::Ready { .. } = events.recv().await.unwrap() {
                break;
            }
        }

        // Never respond, so every admitted request sits in the queue.
        let counter = Arc::new(AtomicU64::new(0));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let h = handle.clone();
            let c = counter.clone();
            receivers.push(tokio::spawn(async move {
                let r = h.submit(b"X".to_vec(), RequestOptions::default()).await;
                c.fetch_add(1, Ordering::SeqCst);
                r
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rejected = handle.submit(b"overflow".to_vec(), RequestOptions::default()).await;
        assert_eq!(rejected, Err(RequestError::QueueFull));

        for r in receivers {
            r.abort();
        }
    }

    #[tokio::test]
    async fn not_ready_before_identification_completes() {
        let factory = Arc::new(FakeTransportFactory::new());
        // No scripted response: identification never completes.
        let handle = spawn(
            "/dev/ttyN".into(),
            policy_for(9600),
            Arc::new(StaticEnumerator::with_path("/dev/ttyN")),
            factory,
        );

        let result = handle.submit(b"PING".to_vec(), RequestOptions::default()).await;
        assert_eq!(result, Err(RequestError::NotReady));
    }
}
