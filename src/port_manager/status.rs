//! The Port Manager status state machine (§4.1).
//!
//! Each state carries a numeric code for observability, matching the table in
//! the specification exactly so external dashboards built against one
//! deployment keep working against another.

/// The Port Manager's current connectivity/readiness state.
///
/// `Ready` is the only state that admits non-probe requests (`code == 2`).
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Error = -1,
    Open = 0,
    Identifying = 1,
    Ready = 2,
    Disconnected = 3,
    Closed = 4,
    NotFound = 5,
    Closing = 6,
    InitFailed = 7,
}

impl Status {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Error => "error",
            Status::Open => "open",
            Status::Identifying => "identifying",
            Status::Ready => "ready",
            Status::Disconnected => "disconnected",
            Status::Closed => "closed",
            Status::NotFound => "not_found",
            Status::Closing => "closing",
            Status::InitFailed => "init_failed",
        }
    }

    /// `true` iff this is the only state in which non-probe requests are
    /// admitted (§4.1 "Request admission").
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Ready)
    }
}
