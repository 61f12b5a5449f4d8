//! Command scheduler: readiness gating, per-session rate limiting, and
//! backoff-driven pausing in front of the dispatcher.
//!
//! The scheduler never talks to the network. It answers two questions for
//! the control loop — "may commands flow at all?" and "may this session send
//! one right now?" — and digests dispatch outcomes into backoff state.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::events::DispatchOutcome;
use crate::registry::SessionState;

const RATE_WINDOW: Duration = Duration::from_secs(1);
const BACKOFF_FLOOR: Duration = Duration::from_millis(1500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Session-local penalty applied to non-throttle dispatch failures.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Readiness preconditions not yet met; nothing is sent.
    Waiting,
    /// Commands flow, subject to per-session budgets.
    Running,
    /// Global hold after a rate-limit rejection.
    Paused,
}

/// Readiness verdict for one gate evaluation.
#[derive(Debug)]
pub struct Readiness {
    pub ready: bool,
    /// Human-readable gaps, e.g. `sess-a: lease`, logged while waiting.
    pub missing: Vec<String>,
}

pub struct CommandScheduler {
    state: RunState,
    /// Disabled when no remote transport is configured; everything passes.
    enabled: bool,
    per_session_rate: u32,
    readiness_timeout: Duration,
    wait_log_interval: Duration,
    last_wait_log: Option<Instant>,
    pause_until: Option<Instant>,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl CommandScheduler {
    pub fn new(
        enabled: bool,
        per_session_rate: u32,
        readiness_timeout: Duration,
        wait_log_interval: Duration,
    ) -> Self {
        Self {
            state: RunState::Waiting,
            enabled,
            per_session_rate: per_session_rate.max(1),
            readiness_timeout,
            wait_log_interval,
            last_wait_log: None,
            pause_until: None,
            windows: HashMap::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Evaluates the readiness gate over every player session. All of them
    /// must show a non-empty frame observed within the readiness timeout, an
    /// active lease, and a non-pending transport. The first full pass moves
    /// the scheduler out of `Waiting`.
    pub fn update_player_readiness<'a>(
        &mut self,
        players: impl IntoIterator<Item = &'a SessionState>,
        now: Instant,
    ) -> Readiness {
        if !self.enabled {
            return Readiness {
                ready: true,
                missing: Vec::new(),
            };
        }
        let mut missing = Vec::new();
        let mut seen = 0usize;
        for session in players {
            seen += 1;
            let mut gaps = Vec::new();
            let frame_fresh = session.has_frame()
                && session
                    .frame_age(now)
                    .is_some_and(|age| age <= self.readiness_timeout);
            if !frame_fresh {
                gaps.push("frame");
            }
            if !session.lease_active {
                gaps.push("lease");
            }
            if session.transport_status.is_pending() {
                gaps.push("transport");
            }
            if !gaps.is_empty() {
                missing.push(format!("{}: {}", session.session_id, gaps.join("+")));
            }
        }
        if seen < 2 {
            missing.push(format!("player sessions: {seen} of 2"));
        }

        let ready = missing.is_empty();
        if ready {
            if self.state == RunState::Waiting {
                self.state = RunState::Running;
                info!(target = "agent.scheduler", "all players ready; commands may flow");
            }
        } else {
            let due = self
                .last_wait_log
                .is_none_or(|at| now.saturating_duration_since(at) >= self.wait_log_interval);
            if due {
                self.last_wait_log = Some(now);
                warn!(
                    target = "agent.scheduler",
                    waiting_on = %missing.join("; "),
                    "scheduler waiting on player readiness"
                );
            }
        }
        Readiness { ready, missing }
    }

    /// Local admission check for one command. Consumes one slot of the
    /// session's rolling one-second budget when admitted.
    pub fn allow_command(&mut self, session: &SessionState, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }
        match self.state {
            RunState::Waiting => return false,
            RunState::Paused => {
                // Blocked until the pause window elapses; afterwards probe
                // commands may flow again while we wait for a success to
                // confirm recovery.
                if self.pause_until.is_some_and(|until| now < until) {
                    return false;
                }
            }
            RunState::Running => {}
        }
        if session
            .command_backoff_until
            .is_some_and(|until| now < until)
        {
            return false;
        }

        let window = self.windows.entry(session.session_id.clone()).or_default();
        while window
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= RATE_WINDOW)
        {
            window.pop_front();
        }
        if window.len() as u32 >= self.per_session_rate {
            debug!(
                target = "agent.scheduler",
                session_id = %session.session_id,
                budget = self.per_session_rate,
                "command rejected by rate limit"
            );
            return false;
        }
        window.push_back(now);
        true
    }

    /// Digests one dispatch outcome into failure counters, backoff, and the
    /// run state. A throttle response pauses every session; a success after
    /// the pause window resumes the flow.
    pub fn handle_outcome(
        &mut self,
        session: &mut SessionState,
        outcome: &DispatchOutcome,
        now: Instant,
    ) {
        if outcome.accepted {
            session.command_failures = 0;
            session.command_backoff_until = None;
            if self.state == RunState::Paused
                && self.pause_until.is_none_or(|until| now >= until)
            {
                self.state = RunState::Running;
                self.pause_until = None;
                info!(target = "agent.scheduler", "backoff cleared; resuming command flow");
            }
            return;
        }

        session.command_failures = session.command_failures.saturating_add(1);
        if outcome.is_rate_limited() {
            let exponent = session.command_failures.saturating_sub(1).min(4);
            let backoff = (BACKOFF_FLOOR * 2u32.pow(exponent)).min(BACKOFF_CAP);
            session.command_backoff_until = Some(now + backoff);
            self.pause_until = Some(now + backoff);
            self.state = RunState::Paused;
            warn!(
                target = "agent.scheduler",
                session_id = %outcome.session_id,
                backoff_ms = backoff.as_millis() as u64,
                "manager throttled actions; pausing all sessions"
            );
        } else {
            session.command_backoff_until = Some(now + FAILURE_BACKOFF);
            warn!(
                target = "agent.scheduler",
                session_id = %outcome.session_id,
                status = ?outcome.status,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "command dispatch failed"
            );
        }
    }

    pub fn forget_session(&mut self, session_id: &str) {
        self.windows.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TransportStatus;

    fn scheduler() -> CommandScheduler {
        CommandScheduler::new(true, 2, Duration::from_secs(2), Duration::from_millis(10))
    }

    fn session(id: &str) -> SessionState {
        SessionState::new(id)
    }

    fn mark_ready(session: &mut SessionState, now: Instant, lease: bool, transport: bool) {
        session.lines = vec!["#####".into(); 10];
        session.last_update = Some(now);
        session.lease_active = lease;
        session.transport_status = if transport {
            TransportStatus::FastPath
        } else {
            TransportStatus::Pending
        };
    }

    fn outcome(session_id: &str, accepted: bool, status: Option<u16>) -> DispatchOutcome {
        DispatchOutcome {
            session_id: session_id.into(),
            command: "m 1.00".into(),
            accepted,
            transport: "http",
            status,
            detail: None,
        }
    }

    #[test]
    fn waits_until_both_players_ready() {
        let mut sched = scheduler();
        let now = Instant::now();
        let mut lhs = session("lhs-session");
        let rhs = {
            let mut s = session("rhs-session");
            mark_ready(&mut s, now, true, true);
            s
        };
        mark_ready(&mut lhs, now, true, true);

        let readiness = sched.update_player_readiness([&lhs], now);
        assert!(!readiness.ready);
        assert!(!sched.allow_command(&lhs, now));
        assert_eq!(sched.state(), RunState::Waiting);

        let readiness = sched.update_player_readiness([&lhs, &rhs], now);
        assert!(readiness.ready);
        assert!(sched.allow_command(&lhs, now + Duration::from_millis(10)));
        assert_eq!(sched.state(), RunState::Running);
    }

    #[test]
    fn rate_limit_caps_commands_per_session() {
        let mut sched = scheduler();
        let now = Instant::now();
        let mut lhs = session("lhs-session");
        let mut rhs = session("rhs-session");
        mark_ready(&mut lhs, now, true, true);
        mark_ready(&mut rhs, now, true, true);
        sched.update_player_readiness([&lhs, &rhs], now);

        assert!(sched.allow_command(&lhs, now));
        assert!(sched.allow_command(&lhs, now + Duration::from_millis(10)));
        assert!(!sched.allow_command(&lhs, now + Duration::from_millis(20)));
        // The other session has its own budget.
        assert!(sched.allow_command(&rhs, now + Duration::from_millis(20)));
        // After the window rolls over the budget resets.
        assert!(sched.allow_command(&lhs, now + Duration::from_millis(1500)));
    }

    #[test]
    fn throttle_applies_backoff_and_success_clears_it() {
        let mut sched = scheduler();
        let now = Instant::now();
        let mut lhs = session("lhs-session");

        sched.handle_outcome(&mut lhs, &outcome("lhs-session", false, Some(429)), now);
        let until = lhs.command_backoff_until.expect("backoff");
        assert!(until.saturating_duration_since(now) >= Duration::from_millis(1500));
        assert!(lhs.command_failures > 0);

        // Repeat throttles double the penalty.
        sched.handle_outcome(&mut lhs, &outcome("lhs-session", false, Some(429)), now);
        let until = lhs.command_backoff_until.expect("backoff");
        assert!(until.saturating_duration_since(now) >= Duration::from_millis(3000));

        sched.handle_outcome(
            &mut lhs,
            &outcome("lhs-session", true, None),
            now + Duration::from_secs(5),
        );
        assert_eq!(lhs.command_failures, 0);
        assert!(lhs.command_backoff_until.is_none());
    }

    #[test]
    fn requires_transport_and_lease_signals() {
        let mut sched = scheduler();
        let now = Instant::now();
        let mut lhs = session("lhs-session");
        let mut rhs = session("rhs-session");
        mark_ready(&mut lhs, now, false, true);
        mark_ready(&mut rhs, now, true, false);

        let readiness = sched.update_player_readiness([&lhs, &rhs], now);
        assert!(!readiness.ready);
        let summary = readiness.missing.join("\n");
        assert!(summary.contains("lease"), "missing lease in {summary}");
        assert!(summary.contains("transport"), "missing transport in {summary}");
    }

    #[test]
    fn pause_and_resume_on_throttle() {
        let mut sched = scheduler();
        let now = Instant::now();
        let mut lhs = session("lhs-session");
        let mut rhs = session("rhs-session");
        mark_ready(&mut lhs, now, true, true);
        mark_ready(&mut rhs, now, true, true);
        sched.update_player_readiness([&lhs, &rhs], now);
        assert_eq!(sched.state(), RunState::Running);

        sched.handle_outcome(&mut lhs, &outcome("lhs-session", false, Some(429)), now);
        assert_eq!(sched.state(), RunState::Paused);
        // Every session is blocked during the pause window, budget or not.
        assert!(!sched.allow_command(&rhs, now + Duration::from_millis(100)));

        let later = now + Duration::from_secs(2);
        sched.handle_outcome(&mut lhs, &outcome("lhs-session", true, None), later);
        assert_eq!(sched.state(), RunState::Running);
        assert!(sched.allow_command(&rhs, later + Duration::from_millis(500)));
    }
}
