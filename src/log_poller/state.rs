use std::fmt;

/// Phase of the poller, observable through [`PollerHandle::state`](super::PollerHandle::state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerState {
    /// Range queries from the start block up to the head minus the safety margin.
    Backfilling,
    /// Closing the gap between the backfill target and the current head.
    CatchingUp,
    /// Tailing the head, by subscription or by polling.
    Live,
    /// Waiting out a backoff delay before resuming from the cursor.
    Reconnecting,
    /// No further RPC calls will be made.
    Stopped,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollerState::Backfilling => "backfilling",
            PollerState::CatchingUp => "catching-up",
            PollerState::Live => "live",
            PollerState::Reconnecting => "reconnecting",
            PollerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
