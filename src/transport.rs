//! The Serial Transport and Port Enumerator external collaborators (§6),
//! made concrete as traits so tests can substitute fakes for real hardware.
//!
//! The production transport drives blocking `serialport` I/O on a dedicated
//! OS thread and bridges its `open`/`error`/`disconnect`/`close`/`data`
//! notifications to the async side over a channel, the same shape a
//! synchronous hardware API takes when adapted into a cooperative async state
//! machine (see DESIGN.md).

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::policy::PortInfo;

const READ_BUF_SIZE: usize = 256;
const THREAD_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A notification pushed from the transport to the owning Port Manager.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The port was opened successfully.
    Open,
    /// Bytes arrived. No framing is applied here; quiescence-based framing is
    /// entirely the Port Manager's concern.
    Data(Vec<u8>),
    /// The transport signalled an error condition.
    Error(String),
    /// The transport detected the device was physically removed.
    Disconnect,
    /// The transport was closed (self-initiated or otherwise).
    Close,
}

/// A command sent from the Port Manager down to the transport.
pub(crate) enum TransportCommand {
    /// Write `data`, report the OS-acknowledged result on the paired channel.
    Write(Vec<u8>, oneshot::Sender<Result<(), String>>),
    /// Close the port. No further events other than `Close` are expected.
    Close,
}

/// A live connection to one open port: a command sink and an event source.
pub struct TransportHandle {
    pub(crate) commands: mpsc::Sender<TransportCommand>,
    pub(crate) events: mpsc::Receiver<TransportEvent>,
}

/// Abstraction over opening a named serial port. Exists so tests can swap in
/// an in-memory fake without touching real hardware.
pub trait TransportFactory: Send + Sync {
    fn open(&self, port_path: &str, baud_rate: u32) -> Result<TransportHandle, String>;
}

/// Abstraction over listing currently attached serial ports.
pub trait PortEnumerator: Send + Sync {
    fn list(&self) -> Vec<PortInfo>;
}

/// Production [`TransportFactory`] backed by the `serialport` crate. Opens
/// the port with a raw byte parser (no OS-level framing) and runs its I/O on
/// a dedicated blocking thread, exactly as the transport contract in §6
/// requires.
pub struct RealTransportFactory;

impl TransportFactory for RealTransportFactory {
    fn open(&self, port_path: &str, baud_rate: u32) -> Result<TransportHandle, String> {
        let port = serialport::new(port_path, baud_rate)
            .timeout(Duration::from_millis(50))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| e.to_string())?;

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (evt_tx, evt_rx) = mpsc::channel(64);

        let port_path = port_path.to_owned();
        std::thread::spawn(move || serial_io_loop(port, port_path, cmd_rx, evt_tx));

        Ok(TransportHandle {
            commands: cmd_tx,
            events: evt_rx,
        })
    }
}

/// Blocking I/O loop run on its own thread. Mirrors the read/command-drain
/// loop shape of a dedicated serial worker: drain pending commands, then
/// attempt a bounded, timed-out read, repeat.
fn serial_io_loop(
    mut port: Box<dyn serialport::SerialPort>,
    port_path: String,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    evt_tx: mpsc::Sender<TransportEvent>,
) {
    if evt_tx.blocking_send(TransportEvent::Open).is_err() {
        return;
    }

    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match cmd_rx.try_recv() {
            Ok(TransportCommand::Write(data, resp)) => {
                let result = port
                    .write_all(&data)
                    .and_then(|_| port.flush())
                    .map_err(|e| e.to_string());
                let _ = resp.send(result);
            }
            Ok(TransportCommand::Close) => {
                let _ = evt_tx.blocking_send(TransportEvent::Close);
                return;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("transport command channel dropped for {port_path}, closing");
                return;
            }
        }

        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                trace!("{port_path}: read {n} bytes");
                if evt_tx.blocking_send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{port_path}: device disconnected: {e}");
                let _ = evt_tx.blocking_send(TransportEvent::Disconnect);
                return;
            }
            Err(e) => {
                warn!("{port_path}: read error: {e}");
                let _ = evt_tx.blocking_send(TransportEvent::Error(e.to_string()));
                return;
            }
        }

        std::thread::sleep(THREAD_POLL_INTERVAL);
    }
}

/// Production [`PortEnumerator`] backed by `serialport::available_ports`.
pub struct RealPortEnumerator;

impl PortEnumerator for RealPortEnumerator {
    fn list(&self) -> Vec<PortInfo> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => PortInfo {
                        path: p.port_name,
                        manufacturer: info.manufacturer,
                        vendor_id: Some(info.vid),
                        product_id: Some(info.pid),
                        serial_number: info.serial_number,
                    },
                    _ => PortInfo {
                        path: p.port_name,
                        ..Default::default()
                    },
                })
                .collect(),
            Err(e) => {
                warn!("port enumeration failed: {e}");
                Vec::new()
            }
        }
    }
}
