//! Connection state machine.
//!
//! # Invariants
//! - Only the transitions listed in `ConnectionMonitor::apply` are accepted.
//! - A rejected event leaves state and `last_transition_at` untouched.
//! - Repeating the signal that produced the current state is a no-op.

use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Online,
    Offline,
    Syncing,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Error => "error",
        }
    }
}

/// Input signal for the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    ConnectivityRestored,
    ConnectivityLost,
    CycleStarted,
    CycleSucceeded,
    CycleFailed,
}

impl ConnectionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectivityRestored => "connectivity_restored",
            Self::ConnectivityLost => "connectivity_lost",
            Self::CycleStarted => "cycle_started",
            Self::CycleSucceeded => "cycle_succeeded",
            Self::CycleFailed => "cycle_failed",
        }
    }
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

impl Display for TransitionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal connection transition: {} on {}",
            self.event.as_str(),
            self.from.as_str()
        )
    }
}

impl Error for TransitionError {}

/// Tracks connectivity and sync-cycle state for one engine.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    state: ConnectionState,
    last_transition_at: i64,
}

impl ConnectionMonitor {
    /// Starts `Online` when the host reports connectivity, else `Offline`.
    pub fn new(host_online: bool, now: i64) -> Self {
        let state = if host_online {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        };
        Self {
            state,
            last_transition_at: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_transition_at(&self) -> i64 {
        self.last_transition_at
    }

    /// Applies `event` and returns the resulting state.
    pub fn apply(
        &mut self,
        event: ConnectionEvent,
        now: i64,
    ) -> Result<ConnectionState, TransitionError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self.state, event) {
            (S::Online, E::ConnectivityRestored)
            | (S::Error, E::ConnectivityRestored)
            | (S::Offline, E::ConnectivityLost) => return Ok(self.state),
            (S::Offline, E::ConnectivityRestored) => S::Online,
            (S::Online | S::Syncing | S::Error, E::ConnectivityLost) => S::Offline,
            (S::Online | S::Error, E::CycleStarted) => S::Syncing,
            (S::Syncing, E::CycleSucceeded) => S::Online,
            (S::Syncing, E::CycleFailed) => S::Error,
            (from, event) => {
                warn!(
                    "event=connection_transition module=sync status=rejected from={} signal={}",
                    from.as_str(),
                    event.as_str()
                );
                return Err(TransitionError { from, event });
            }
        };

        info!(
            "event=connection_transition module=sync status=ok from={} to={} signal={}",
            self.state.as_str(),
            next.as_str(),
            event.as_str()
        );
        self.state = next;
        self.last_transition_at = now;
        Ok(next)
    }
}
