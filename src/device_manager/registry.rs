//! Fleet-wide state the Device Manager serializes access to: the set of
//! spawned Port Managers, the device-id-to-port map, and the
//! refresh-coalescing gate (§4.2).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::device_manager::events::DeviceManagerEvent;
use crate::policy::{OptionOutcome, OptionPolicy};
use crate::port_manager::{self, PortManagerEvent, PortManagerHandle};
use crate::request::DeviceId;
use crate::transport::{PortEnumerator, TransportFactory};

/// Whether an enumeration pass is already underway. The leader (first caller
/// to find `Idle`) runs it; everyone else subscribes to the leader's
/// completion broadcast rather than starting a redundant pass of their own.
enum RefreshGate {
    Idle,
    InProgress(broadcast::Sender<()>),
}

pub(crate) struct Registry {
    policy: Arc<dyn OptionPolicy>,
    enumerator: Arc<dyn PortEnumerator>,
    transport_factory: Arc<dyn TransportFactory>,
    ports: Mutex<HashMap<String, PortManagerHandle>>,
    /// Current owner of each identified device; removed on disconnect.
    devices: Mutex<HashMap<DeviceId, String>>,
    /// Every device id ever identified by this process, monotonic (§3:
    /// "everSeenIds"). Drives the `new` vs `connect` classification and is
    /// never pruned, unlike `devices`.
    ever_seen: Mutex<HashSet<DeviceId>>,
    refresh_gate: Mutex<RefreshGate>,
    events: broadcast::Sender<DeviceManagerEvent>,
}

impl Registry {
    pub(crate) fn new(
        policy: Arc<dyn OptionPolicy>,
        enumerator: Arc<dyn PortEnumerator>,
        transport_factory: Arc<dyn TransportFactory>,
        events: broadcast::Sender<DeviceManagerEvent>,
    ) -> Self {
        Registry {
            policy,
            enumerator,
            transport_factory,
            ports: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            ever_seen: Mutex::new(HashSet::new()),
            refresh_gate: Mutex::new(RefreshGate::Idle),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeviceManagerEvent> {
        self.events.subscribe()
    }

    /// Run, or join, one enumeration pass (§4.2: "concurrent refresh requests
    /// share its completion").
    pub(crate) async fn refresh(self: &Arc<Self>) {
        let mut gate = self.refresh_gate.lock().await;
        match &*gate {
            RefreshGate::InProgress(leader) => {
                let mut done = leader.subscribe();
                drop(gate);
                let _ = done.recv().await;
            }
            RefreshGate::Idle => {
                let (leader, _) = broadcast::channel(1);
                *gate = RefreshGate::InProgress(leader.clone());
                drop(gate);
                self.run_refresh_pass().await;
                let _ = leader.send(());
                *self.refresh_gate.lock().await = RefreshGate::Idle;
            }
        }
    }

    async fn run_refresh_pass(self: &Arc<Self>) {
        let observed = self.enumerator.list();
        let mut ports = self.ports.lock().await;
        for info in observed {
            if ports.contains_key(&info.path) {
                continue;
            }
            if matches!(self.policy.evaluate(&info), OptionOutcome::Ignore) {
                continue;
            }
            let handle = port_manager::spawn(
                info.path.clone(),
                self.policy.clone(),
                self.enumerator.clone(),
                self.transport_factory.clone(),
            );
            self.spawn_event_forwarder(info.path.clone(), handle.clone());
            ports.insert(info.path, handle);
        }
    }

    /// Forward one Port Manager's events into the device map, re-publishing
    /// them as [`DeviceManagerEvent`]s for fleet-wide subscribers.
    fn spawn_event_forwarder(self: &Arc<Self>, port_path: String, handle: PortManagerHandle) {
        let registry = self.clone();
        let mut events = handle.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PortManagerEvent::Ready { id })
                    | Ok(PortManagerEvent::Reinitialized { id })
                    | Ok(PortManagerEvent::IdChange { id }) => {
                        registry.device_connected(&port_path, id).await;
                    }
                    Ok(PortManagerEvent::Disconnect { id: Some(id) }) => {
                        registry.device_disconnected(id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn device_connected(&self, port_path: &str, id: DeviceId) {
        self.devices.lock().await.insert(id.clone(), port_path.to_owned());

        let is_new = {
            let mut ever_seen = self.ever_seen.lock().await;
            let is_new = !ever_seen.contains(&id);
            ever_seen.insert(id.clone());
            is_new
        };
        let event = if is_new {
            DeviceManagerEvent::New { id }
        } else {
            DeviceManagerEvent::Connect { id }
        };
        let _ = self.events.send(event);
    }

    async fn device_disconnected(&self, id: DeviceId) {
        self.devices.lock().await.remove(&id);
        let _ = self.events.send(DeviceManagerEvent::Disconnect { id });
    }

    async fn lookup(&self, id: &DeviceId) -> Option<PortManagerHandle> {
        let port_path = self.devices.lock().await.get(id).cloned()?;
        self.ports.lock().await.get(&port_path).cloned()
    }

    /// Resolve `id` to its owning Port Manager, waiting up to `timeout` for
    /// it to be identified if it is not already known (§4.2: "Request ...
    /// discovery deadline").
    pub(crate) async fn resolve_or_wait(self: &Arc<Self>, id: &DeviceId, timeout: Duration) -> Option<PortManagerHandle> {
        // Subscribe before the initial lookup so a `New`/`Connect` published
        // between the lookup and the wait below can never be missed.
        let mut events = self.events.subscribe();
        if let Some(handle) = self.lookup(id).await {
            return Some(handle);
        }

        // Not yet known: trigger an enumeration pass before waiting, so a
        // device on a not-yet-enumerated port has a chance to be found
        // instead of just waiting out the deadline (§4.2 resolution step 2).
        self.refresh().await;
        if let Some(handle) = self.lookup(id).await {
            return Some(handle);
        }

        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                evt = events.recv() => {
                    match evt {
                        Ok(DeviceManagerEvent::New { id: seen }) | Ok(DeviceManagerEvent::Connect { id: seen }) if seen == *id => {
                            return self.lookup(id).await;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    pub(crate) async fn list_device_ids(&self) -> Vec<DeviceId> {
        self.devices.lock().await.keys().cloned().collect()
    }
}
