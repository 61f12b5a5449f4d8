//! The typed events flowing over the single shared channel.
//!
//! Background actors, the dispatcher, the console, and discovery tasks all
//! produce `AgentEvent`s; only the control loop consumes them. Actors never
//! touch registry state directly.

use manager_client::{ControllerLease, ControllerPairingEvent, StateDiff};

use crate::autopair::AutopairContext;
use crate::console::ConsoleCommand;

/// Which transport produced a frame. Used to derive a session's transport
/// status when no richer pairing telemetry is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Stream,
    Poll,
}

#[derive(Debug)]
pub enum AgentEvent {
    /// A state diff arrived for a session, from the stream or the poller.
    Frame {
        session_id: String,
        origin: FrameOrigin,
        diff: StateDiff,
    },
    /// Controller lease acquired or renewed.
    Lease(ControllerLease),
    /// A pairing was added, updated, or removed for the controller session.
    Pairing(ControllerPairingEvent),
    /// Outcome of one dispatched command, reported by the dispatcher.
    Dispatch(DispatchOutcome),
    /// Operator console input.
    Console(ConsoleCommand),
    /// Topology discovery finished with a fresh context.
    Discovered(Box<AutopairContext>),
    /// Topology discovery exhausted its attempt budget.
    DiscoveryFailed,
    Info(String),
    Warn(String),
    Error(String),
}

/// What happened to a dispatched command, across whichever transports were
/// configured. `accepted` reflects the primary remote transport when one is
/// configured, otherwise local recording.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub session_id: String,
    pub command: String,
    pub accepted: bool,
    pub transport: &'static str,
    pub status: Option<u16>,
    pub detail: Option<String>,
}

impl DispatchOutcome {
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(429)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }
}
