//! The bounded single-consumer request queue and the quiescence-based
//! response framer (§4.1). This is the heart of the Port Manager.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::policy::ResponseCheck;
use crate::port_manager::status::Status;
use crate::request::{DeviceId, Request};

/// What the currently-connected session is doing right now. At most one of
/// these is ever active, matching the "at most one Request actively written"
/// invariant (§3).
pub(crate) enum Activity {
    /// Nothing in flight; the next queue head (or the identification probe)
    /// may start as soon as its turn comes.
    Idle,
    /// The identification probe was written and its response is being
    /// assembled.
    Identifying {
        deadline: Instant,
        buffer: Vec<u8>,
        last_len: usize,
    },
    /// A regular Request was written and its response is being assembled.
    Executing {
        request: Request,
        deadline: Instant,
        buffer: Vec<u8>,
        last_len: usize,
    },
}

impl Activity {
    /// The instant at which the quiescence timer should next fire, or a
    /// stand-in far-future instant when nothing is being timed (the Port
    /// Manager still needs *a* deadline to hand to `select!`).
    pub(crate) fn deadline(&self) -> Instant {
        match self {
            Activity::Idle => Instant::now() + Duration::from_secs(365 * 24 * 3600),
            Activity::Identifying { deadline, .. } | Activity::Executing { deadline, .. } => *deadline,
        }
    }

    /// Append newly-arrived bytes to whichever buffer is currently being
    /// assembled. A no-op (with a debug log upstream) when idle — stray data
    /// with nothing awaiting it.
    pub(crate) fn push_data(&mut self, bytes: &[u8]) {
        match self {
            Activity::Identifying { buffer, .. } | Activity::Executing { buffer, .. } => {
                buffer.extend_from_slice(bytes)
            }
            Activity::Idle => {}
        }
    }
}

/// Result of one quiescence-timer tick: either the buffer grew since it was
/// last armed (restart the window) or it has gone quiet (response is done).
pub(crate) enum Tick {
    StillGrowing,
    Quiescent,
}

/// Re-arm or settle the quiescence timer, per the "force first tick, restart
/// on growth" rule in §4.1. Implemented as a plain comparison — the caller's
/// `select!` loop supplies the repetition, so there is no recursion here.
pub(crate) fn tick(buffer_len: usize, last_len: &mut usize, deadline: &mut Instant, timeout: Duration) -> Tick {
    if buffer_len > *last_len {
        *last_len = buffer_len;
        *deadline = Instant::now() + timeout;
        Tick::StillGrowing
    } else {
        Tick::Quiescent
    }
}

/// Outcome of validating a finished buffer against an optional `checkResponse`
/// predicate.
pub(crate) enum Validation {
    Accepted(Vec<u8>),
    Rejected,
}

pub(crate) fn validate(buffer: Vec<u8>, check: Option<&ResponseCheck>) -> Validation {
    match check {
        Some(predicate) if !predicate(&buffer) => Validation::Rejected,
        _ => Validation::Accepted(buffer),
    }
}

/// Admission outcome for a just-submitted command.
pub(crate) enum Admission {
    Admitted,
    NotReady,
    QueueFull,
}

/// Apply the admission gate from §4.1: non-probe commands require `Ready`,
/// and the queue's effective capacity is `maxQueueLength + 1` because the
/// overflow check is a strict `>` (an observed source behaviour, preserved;
/// see SPEC_FULL.md / DESIGN.md Open Question (a)).
pub(crate) fn admit(status: Status, queue_len: usize, max_queue_length: usize) -> Admission {
    if !status.is_ready() {
        return Admission::NotReady;
    }
    if queue_len > max_queue_length {
        return Admission::QueueFull;
    }
    Admission::Admitted
}

/// Pop the head request, failing it immediately with `StaleIdentity` if its
/// captured device id no longer matches the current one, and repeat until a
/// live request (or an empty queue) is found.
pub(crate) fn next_live_request(queue: &mut VecDeque<Request>, current_id: &Option<DeviceId>) -> Option<Request> {
    while let Some(request) = queue.pop_front() {
        if let Some(captured) = &request.capture_device_id {
            if Some(captured) != current_id.as_ref() {
                let _ = request
                    .resolver
                    .send(Err(crate::error::RequestError::StaleIdentity));
                continue;
            }
        }
        return Some(request);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_strict_capacity() {
        assert!(matches!(admit(Status::Ready, 0, 2), Admission::Admitted));
        assert!(matches!(admit(Status::Ready, 2, 2), Admission::Admitted));
        assert!(matches!(admit(Status::Ready, 3, 2), Admission::QueueFull));
    }

    #[test]
    fn rejects_non_probe_when_not_ready() {
        assert!(matches!(admit(Status::Identifying, 0, 30), Admission::NotReady));
        assert!(matches!(admit(Status::Open, 0, 30), Admission::NotReady));
    }

    #[test]
    fn restarts_on_growth_and_settles_when_quiet() {
        let mut last_len = 0usize;
        let mut deadline = Instant::now();
        let first_deadline = deadline;
        assert!(matches!(tick(3, &mut last_len, &mut deadline, Duration::from_millis(200)), Tick::StillGrowing));
        assert!(deadline > first_deadline || deadline == first_deadline);
        assert_eq!(last_len, 3);
        assert!(matches!(tick(3, &mut last_len, &mut deadline, Duration::from_millis(200)), Tick::Quiescent));
    }

    #[test]
    fn validation_passes_through_without_a_predicate() {
        assert!(matches!(validate(vec![1, 2, 3], None), Validation::Accepted(_)));
    }

    #[test]
    fn validation_rejects_when_predicate_fails() {
        let check: ResponseCheck = std::sync::Arc::new(|buf: &[u8]| buf.ends_with(b"\n"));
        assert!(matches!(validate(b"OK".to_vec(), Some(&check)), Validation::Rejected));
        assert!(matches!(validate(b"OK\n".to_vec(), Some(&check)), Validation::Accepted(_)));
    }
}
