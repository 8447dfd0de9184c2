//! The reconnection loop and the connected session it runs once a transport
//! is open (§4.1): the task body a Port Manager is spawned to run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use super::queue::{self, Activity};
use super::status::Status;
use super::{events::PortManagerEvent, PortManagerCommand};
use crate::error::{RequestError, SessionEnd};
use crate::policy::{OptionOutcome, OptionPolicy, PortConfig};
use crate::request::{DeviceId, Request};
use crate::transport::{PortEnumerator, TransportCommand, TransportEvent, TransportFactory, TransportHandle};

/// Delay before re-enumerating after the port went missing or failed to
/// open. Not part of the public configuration surface; a fleet-wide fleet
/// of a few hundred ports polling every two seconds is cheap background
/// noise, matching the teacher's own polling cadence for its boot loop.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Fixed delay before the first identification probe after `Open`, and
/// before each retry after `InitFailed`. Unlike `serial_response_timeout`
/// (how long a probe is given to answer), this is how long the Port Manager
/// waits before *sending* one; both are specified as flat 2 s constants.
const IDENTIFY_DELAY: Duration = Duration::from_secs(2);

pub(crate) async fn run(
    port_path: String,
    policy: Arc<dyn OptionPolicy>,
    enumerator: Arc<dyn PortEnumerator>,
    transport_factory: Arc<dyn TransportFactory>,
    mut commands: mpsc::Receiver<PortManagerCommand>,
    events: broadcast::Sender<PortManagerEvent>,
) {
    let mut current_id: Option<DeviceId> = None;
    let mut last_status: Option<Status> = None;
    // Owned here, not by `run_session`, so a reconnect carries it forward
    // instead of discarding it: an id-change or disconnect does not drain
    // pending Requests (§4.1), only a full shutdown does.
    let mut queue: VecDeque<Request> = VecDeque::new();

    loop {
        let config = match find_and_evaluate(&port_path, &enumerator, &policy) {
            Some(config) => config,
            None => {
                publish_status(&events, &mut last_status, Status::NotFound, None);
                if !wait_or_drain(&mut commands, RECONNECT_DELAY).await {
                    return;
                }
                continue;
            }
        };

        publish_status(&events, &mut last_status, Status::Open, None);

        let mut transport = match transport_factory.open(&port_path, config.baud_rate) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("{port_path}: failed to open: {e}");
                publish_status(&events, &mut last_status, Status::Error, Some(e));
                if !wait_or_drain(&mut commands, RECONNECT_DELAY).await {
                    return;
                }
                continue;
            }
        };

        match transport.events.recv().await {
            Some(TransportEvent::Open) => {
                info!("{port_path} => Open");
                let _ = events.send(PortManagerEvent::Open);
            }
            Some(TransportEvent::Error(e)) => {
                publish_status(&events, &mut last_status, Status::Error, Some(e));
                if !wait_or_drain(&mut commands, RECONNECT_DELAY).await {
                    return;
                }
                continue;
            }
            Some(TransportEvent::Disconnect) => {
                publish_status(&events, &mut last_status, Status::Disconnected, None);
                if !wait_or_drain(&mut commands, RECONNECT_DELAY).await {
                    return;
                }
                continue;
            }
            Some(TransportEvent::Close) | None => {
                publish_status(&events, &mut last_status, Status::Closed, None);
                if !wait_or_drain(&mut commands, RECONNECT_DELAY).await {
                    return;
                }
                continue;
            }
            Some(TransportEvent::Data(_)) => {
                debug!("{port_path}: stray data before the transport announced itself open");
            }
        }

        match run_session(&port_path, &config, &mut transport, &mut commands, &events, &mut current_id, &mut last_status, &mut queue).await {
            SessionOutcome::Reconnect(reason) => {
                let (status, message) = match &reason {
                    SessionEnd::Disconnected => (Status::Disconnected, None),
                    SessionEnd::Closed => (Status::Closed, None),
                    SessionEnd::TransportError(msg) => (Status::Error, Some(msg.clone())),
                };
                publish_status(&events, &mut last_status, status, message);
                let _ = events.send(PortManagerEvent::Disconnect { id: current_id.clone() });
                if !wait_or_drain(&mut commands, RECONNECT_DELAY).await {
                    return;
                }
            }
            SessionOutcome::Shutdown => return,
        }
    }
}

fn find_and_evaluate(port_path: &str, enumerator: &Arc<dyn PortEnumerator>, policy: &Arc<dyn OptionPolicy>) -> Option<PortConfig> {
    let info = enumerator.list().into_iter().find(|p| p.path == port_path)?;
    match policy.evaluate(&info) {
        OptionOutcome::Accept(config) => Some(config),
        OptionOutcome::Ignore => None,
    }
}

/// Service the command queue while nothing is open, answering every
/// submission with `NotReady` (the identification probe is exempt from
/// admission, but there is no transport to send it down while waiting).
/// Returns `false` once the command channel closes, meaning every handle was
/// dropped and this Port Manager should stop for good.
async fn wait_or_drain(commands: &mut mpsc::Receiver<PortManagerCommand>, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        tokio::select! {
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(PortManagerCommand::Submit { resolver, .. }) => {
                        let _ = resolver.send(Err(RequestError::NotReady));
                    }
                    None => return false,
                }
            }
            _ = tokio::time::sleep_until(deadline) => return true,
        }
    }
}

enum SessionOutcome {
    Reconnect(SessionEnd),
    Shutdown,
}

/// Run one connected session: repeated identification attempts until
/// `Ready`, then serving the request queue, until the transport ends or the
/// command channel closes.
async fn run_session(
    port_path: &str,
    config: &PortConfig,
    transport: &mut TransportHandle,
    commands: &mut mpsc::Receiver<PortManagerCommand>,
    events: &broadcast::Sender<PortManagerEvent>,
    current_id: &mut Option<DeviceId>,
    last_status: &mut Option<Status>,
    queue: &mut VecDeque<Request>,
) -> SessionOutcome {
    let mut status = Status::Open;
    let mut activity = Activity::Idle;
    let mut next_identify_attempt = Instant::now() + IDENTIFY_DELAY;

    loop {
        if matches!(activity, Activity::Idle) {
            if status != Status::Ready {
                if Instant::now() < next_identify_attempt {
                    // Backing off after a failed probe; fall through to select.
                } else {
                    let (resp_tx, resp_rx) = oneshot::channel();
                    if transport
                        .commands
                        .send(TransportCommand::Write(config.get_id_command.clone(), resp_tx))
                        .await
                        .is_err()
                    {
                        return SessionOutcome::Reconnect(SessionEnd::Closed);
                    }
                    match resp_rx.await {
                        Ok(Ok(())) => {
                            status = Status::Identifying;
                            info!("{port_path} => Identifying");
                            publish_status(events, last_status, status, None);
                            activity = Activity::Identifying {
                                deadline: Instant::now() + config.serial_response_timeout,
                                buffer: Vec::new(),
                                last_len: 0,
                            };
                        }
                        Ok(Err(e)) => {
                            status = Status::InitFailed;
                            warn!("{port_path} => InitFailed: write failed: {e}");
                            publish_status(events, last_status, status, Some(e));
                            next_identify_attempt = Instant::now() + IDENTIFY_DELAY;
                        }
                        Err(_) => {
                            return SessionOutcome::Reconnect(SessionEnd::Closed);
                        }
                    }
                }
            } else if let Some(request) = queue::next_live_request(queue, current_id) {
                let (resp_tx, resp_rx) = oneshot::channel();
                let timeout = request.timeout.unwrap_or(config.serial_response_timeout);
                if transport
                    .commands
                    .send(TransportCommand::Write(request.command.clone(), resp_tx))
                    .await
                    .is_err()
                {
                    let _ = request.resolver.send(Err(RequestError::WriteFailed("transport closed".into())));
                    return SessionOutcome::Reconnect(SessionEnd::Closed);
                }
                match resp_rx.await {
                    Ok(Ok(())) => {
                        activity = Activity::Executing {
                            request,
                            deadline: Instant::now() + timeout,
                            buffer: Vec::new(),
                            last_len: 0,
                        };
                    }
                    Ok(Err(e)) => {
                        warn!("{port_path} => Closing: write failed: {e}");
                        let _ = request.resolver.send(Err(RequestError::WriteFailed(e)));
                        status = Status::Closing;
                        publish_status(events, last_status, status, None);
                        let _ = transport.commands.send(TransportCommand::Close).await;
                        return SessionOutcome::Reconnect(SessionEnd::Closed);
                    }
                    Err(_) => {
                        let _ = request.resolver.send(Err(RequestError::WriteFailed("transport closed".into())));
                        return SessionOutcome::Reconnect(SessionEnd::Closed);
                    }
                }
            }
        }

        // When idle and not yet `Ready`, the next identify attempt may be
        // armed further in the future than `activity`'s placeholder
        // far-future deadline; wake at whichever comes first so the probe
        // retry is never starved.
        let wake_at = if matches!(activity, Activity::Idle) && status != Status::Ready {
            std::cmp::min(activity.deadline(), next_identify_attempt)
        } else {
            activity.deadline()
        };

        tokio::select! {
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(PortManagerCommand::Submit { command, timeout, resolver }) => {
                        match queue::admit(status, queue.len(), config.max_queue_length) {
                            queue::Admission::Admitted => {
                                queue.push_back(Request {
                                    command,
                                    timeout,
                                    capture_device_id: current_id.clone(),
                                    resolver,
                                });
                            }
                            queue::Admission::NotReady => {
                                let _ = resolver.send(Err(RequestError::NotReady));
                            }
                            queue::Admission::QueueFull => {
                                let _ = resolver.send(Err(RequestError::QueueFull));
                            }
                        }
                    }
                    None => {
                        fail_in_flight(activity, "port manager shutting down");
                        for request in queue.drain(..) {
                            let _ = request.resolver.send(Err(RequestError::NotReady));
                        }
                        return SessionOutcome::Shutdown;
                    }
                }
            }

            maybe_evt = transport.events.recv() => {
                match maybe_evt {
                    Some(TransportEvent::Data(bytes)) => activity.push_data(&bytes),
                    Some(TransportEvent::Error(e)) => {
                        warn!("{port_path}: transport error: {e}");
                        fail_in_flight(activity, &e);
                        return SessionOutcome::Reconnect(SessionEnd::TransportError(e));
                    }
                    Some(TransportEvent::Disconnect) => {
                        info!("{port_path} => Disconnected");
                        fail_in_flight(activity, "device disconnected");
                        return SessionOutcome::Reconnect(SessionEnd::Disconnected);
                    }
                    Some(TransportEvent::Close) => {
                        info!("{port_path} => Closed");
                        fail_in_flight(activity, "transport closed");
                        return SessionOutcome::Reconnect(SessionEnd::Closed);
                    }
                    Some(TransportEvent::Open) => {}
                    None => {
                        fail_in_flight(activity, "transport closed");
                        return SessionOutcome::Reconnect(SessionEnd::Closed);
                    }
                }
            }

            _ = tokio::time::sleep_until(wake_at) => {
                let taken = std::mem::replace(&mut activity, Activity::Idle);
                match taken {
                    Activity::Idle => {}
                    Activity::Identifying { mut buffer, mut last_len, mut deadline } => {
                        match queue::tick(buffer.len(), &mut last_len, &mut deadline, config.serial_response_timeout) {
                            queue::Tick::StillGrowing => {
                                activity = Activity::Identifying { buffer, last_len, deadline };
                            }
                            queue::Tick::Quiescent => {
                                handle_identify_result(port_path, buffer, config, events, last_status, current_id, &mut status, &mut next_identify_attempt);
                            }
                        }
                    }
                    Activity::Executing { request, mut buffer, mut last_len, mut deadline } => {
                        match queue::tick(buffer.len(), &mut last_len, &mut deadline, config.serial_response_timeout) {
                            queue::Tick::StillGrowing => {
                                activity = Activity::Executing { request, buffer, last_len, deadline };
                            }
                            queue::Tick::Quiescent => {
                                match queue::validate(buffer, config.check_response.as_ref()) {
                                    queue::Validation::Accepted(bytes) => {
                                        let text = String::from_utf8_lossy(&bytes).into_owned();
                                        let _ = request.resolver.send(Ok(text));
                                    }
                                    queue::Validation::Rejected => {
                                        let _ = request.resolver.send(Err(RequestError::ValidationFailed));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Classify a finished identification buffer and publish the resulting
/// status/event pair, or fall back to `InitFailed` and arm the retry backoff.
fn handle_identify_result(
    port_path: &str,
    buffer: Vec<u8>,
    config: &PortConfig,
    events: &broadcast::Sender<PortManagerEvent>,
    last_status: &mut Option<Status>,
    current_id: &mut Option<DeviceId>,
    status: &mut Status,
    next_identify_attempt: &mut Instant,
) {
    let validated = match queue::validate(buffer, config.check_response.as_ref()) {
        queue::Validation::Accepted(bytes) => Some(bytes),
        queue::Validation::Rejected => None,
    };
    let parsed = validated.and_then(|bytes| (config.get_id_response_parser)(&bytes));

    match parsed {
        Some(id) if !id.is_empty() => {
            let event = match current_id {
                None => PortManagerEvent::Ready { id: id.clone() },
                Some(prev) if *prev == id => PortManagerEvent::Reinitialized { id: id.clone() },
                Some(_) => PortManagerEvent::IdChange { id: id.clone() },
            };
            info!("{port_path} => Ready ({id})");
            *current_id = Some(id);
            *status = Status::Ready;
            publish_status(events, last_status, *status, None);
            let _ = events.send(event);
        }
        _ => {
            warn!("{port_path} => InitFailed: identification response rejected");
            *status = Status::InitFailed;
            publish_status(events, last_status, *status, None);
            *next_identify_attempt = Instant::now() + IDENTIFY_DELAY;
        }
    }
}

/// Fail the one request currently in flight, if any, when the session ends.
/// The rest of the queue is left untouched: an id-change or disconnect does
/// not drain pending Requests (§4.1); they fail with `StaleIdentity` as they
/// reach the head of the next session, or are served normally if the
/// identity did not change.
fn fail_in_flight(activity: Activity, reason: &str) {
    if let Activity::Executing { request, .. } = activity {
        let _ = request.resolver.send(Err(RequestError::WriteFailed(reason.to_owned())));
    }
}

/// Send `status_changed` only when `status` differs from the last status
/// this session emitted (§4.1: "edge-triggered, no event on code==previous").
fn publish_status(events: &broadcast::Sender<PortManagerEvent>, last_status: &mut Option<Status>, status: Status, message: Option<String>) {
    if *last_status == Some(status) {
        return;
    }
    *last_status = Some(status);
    let _ = events.send(PortManagerEvent::status_changed(status, message));
}
