//! In-memory fakes standing in for real hardware in tests, in the shape the
//! `TransportFactory`/`PortEnumerator` traits were introduced for.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::policy::PortInfo;
use crate::transport::{PortEnumerator, TransportCommand, TransportEvent, TransportFactory, TransportHandle};

enum ScriptEntry {
    Respond(Vec<u8>),
    Trickle(Vec<Vec<u8>>, Duration),
}

/// A [`TransportFactory`] whose opened ports reply to whatever was scripted
/// for that path, one scripted entry consumed per write.
pub(crate) struct FakeTransportFactory {
    scripts: Arc<Mutex<HashMap<String, VecDeque<ScriptEntry>>>>,
}

impl FakeTransportFactory {
    pub(crate) fn new() -> Self {
        FakeTransportFactory {
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The next write to `path` gets `bytes` back as a single `Data` event.
    pub(crate) fn script_response(&self, path: &str, bytes: Vec<u8>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push_back(ScriptEntry::Respond(bytes));
    }

    /// The next write to `path` gets `chunks` back one at a time, `interval`
    /// apart, exercising the quiescence framer's restart-on-growth rule.
    pub(crate) fn script_trickle(&self, path: &str, chunks: Vec<Vec<u8>>, interval: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push_back(ScriptEntry::Trickle(chunks, interval));
    }
}

impl TransportFactory for FakeTransportFactory {
    fn open(&self, port_path: &str, _baud_rate: u32) -> Result<TransportHandle, String> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        let (evt_tx, evt_rx) = mpsc::channel(64);
        let scripts = self.scripts.clone();
        let path = port_path.to_owned();

        tokio::spawn(async move {
            if evt_tx.send(TransportEvent::Open).await.is_err() {
                return;
            }

            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::Write(_data, resp) => {
                        let _ = resp.send(Ok(()));
                        let entry = scripts.lock().unwrap().get_mut(&path).and_then(|q| q.pop_front());
                        match entry {
                            Some(ScriptEntry::Respond(bytes)) => {
                                if evt_tx.send(TransportEvent::Data(bytes)).await.is_err() {
                                    return;
                                }
                            }
                            Some(ScriptEntry::Trickle(chunks, interval)) => {
                                for chunk in chunks {
                                    tokio::time::sleep(interval).await;
                                    if evt_tx.send(TransportEvent::Data(chunk)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            None => {}
                        }
                    }
                    TransportCommand::Close => {
                        let _ = evt_tx.send(TransportEvent::Close).await;
                        return;
                    }
                }
            }
        });

        Ok(TransportHandle {
            commands: cmd_tx,
            events: evt_rx,
        })
    }
}

/// A [`PortEnumerator`] that always reports the same fixed set of ports.
pub(crate) struct StaticEnumerator {
    ports: Vec<PortInfo>,
}

impl StaticEnumerator {
    pub(crate) fn with_path(path: &str) -> Self {
        Self::with_paths(&[path])
    }

    pub(crate) fn with_paths(paths: &[&str]) -> Self {
        StaticEnumerator {
            ports: paths
                .iter()
                .map(|path| PortInfo {
                    path: (*path).to_owned(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

impl PortEnumerator for StaticEnumerator {
    fn list(&self) -> Vec<PortInfo> {
        self.ports.clone()
    }
}
