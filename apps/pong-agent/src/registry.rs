//! Session registry: the control loop's single-writer view of every tracked
//! session, its side assignment, physical estimates, and readiness.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::perception::{self, BallTracker, PaddleEstimate, TerminalFrame};

/// Paddle-controlling side. Serialized as the wire labels `lhs`/`rhs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "lhs")]
    Left,
    #[serde(rename = "rhs")]
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "lhs",
            Side::Right => "rhs",
        }
    }

    pub fn parse(value: &str) -> Option<Side> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lhs" | "left" | "l" => Some(Side::Left),
            "rhs" | "right" | "r" => Some(Side::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a session plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Agent,
    Player(Side),
}

impl SessionRole {
    pub fn parse(value: &str) -> Option<SessionRole> {
        if value.trim().eq_ignore_ascii_case("agent") {
            return Some(SessionRole::Agent);
        }
        Side::parse(value).map(SessionRole::Player)
    }
}

/// Transport currently delivering state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Pending,
    FastPath,
    HttpFallback,
    HttpPoller,
}

impl TransportStatus {
    /// Folds the free-form labels seen on the wire (pairing telemetry,
    /// data-channel names, cadence hints) into the canonical set. Unknown
    /// and absent labels stay `Pending`.
    pub fn from_label(label: Option<&str>) -> TransportStatus {
        let Some(label) = label else {
            return TransportStatus::Pending;
        };
        let folded: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if folded.is_empty() {
            TransportStatus::Pending
        } else if folded.contains("fast") || folded.contains("controller") {
            TransportStatus::FastPath
        } else if folded.contains("fallback") {
            TransportStatus::HttpFallback
        } else if folded.contains("poll") || folded.contains("http") {
            TransportStatus::HttpPoller
        } else {
            TransportStatus::Pending
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportStatus::Pending => "pending",
            TransportStatus::FastPath => "fast_path",
            TransportStatus::HttpFallback => "http_fallback",
            TransportStatus::HttpPoller => "http_poller",
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, TransportStatus::Pending)
    }
}

/// Everything the control loop knows about one session.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub side: Option<Side>,
    /// True when the side came from an authoritative role map rather than
    /// round-robin defaulting; such sides are never overwritten silently.
    pub side_authoritative: bool,
    pub last_sequence: u64,
    pub lines: Vec<String>,
    pub cursor: Option<(u16, u16)>,
    pub paddle: Option<PaddleEstimate>,
    pub ball: BallTracker,
    pub last_update: Option<Instant>,
    pub last_command: Option<Instant>,
    pub lease_active: bool,
    pub transport_status: TransportStatus,
    pub command_failures: u32,
    pub command_backoff_until: Option<Instant>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            side: None,
            side_authoritative: false,
            last_sequence: 0,
            lines: Vec::new(),
            cursor: None,
            paddle: None,
            ball: BallTracker::default(),
            last_update: None,
            last_command: None,
            lease_active: false,
            transport_status: TransportStatus::Pending,
            command_failures: 0,
            command_backoff_until: None,
        }
    }

    /// Applies a frame if it advances the session's sequence. Duplicate and
    /// out-of-order frames are discarded, so a poller racing a stream can
    /// never clobber newer state.
    pub fn apply_frame(&mut self, frame: TerminalFrame, now: Instant) -> bool {
        if frame.sequence <= self.last_sequence {
            return false;
        }
        self.last_sequence = frame.sequence;
        self.lines = frame.lines;
        self.cursor = frame.cursor;
        self.last_update = Some(now);
        self.paddle = perception::detect_paddle(&self.lines);
        self.ball.observe(perception::detect_ball(&self.lines), now);
        true
    }

    pub fn height(&self) -> usize {
        self.lines.len()
    }

    pub fn has_frame(&self) -> bool {
        !self.lines.is_empty()
    }

    pub fn frame_age(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|at| now.saturating_duration_since(at))
    }
}

/// Registry of tracked sessions, in registration order. Mutated only by the
/// control loop.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionState>,
    order: Vec<String>,
    role_map: HashMap<String, SessionRole>,
}

impl SessionRegistry {
    pub fn new(role_map: HashMap<String, SessionRole>) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            role_map,
        }
    }

    pub fn role_map(&self) -> &HashMap<String, SessionRole> {
        &self.role_map
    }

    /// Merges authoritative role assignments, updating already-registered
    /// sessions. An authoritative side may replace a heuristic one, never
    /// the other way around.
    pub fn merge_roles(&mut self, roles: &HashMap<String, SessionRole>) {
        for (session_id, role) in roles {
            self.role_map.insert(session_id.clone(), *role);
            if let Some(session) = self.sessions.get_mut(session_id) {
                if let SessionRole::Player(side) = role {
                    session.side = Some(*side);
                    session.side_authoritative = true;
                }
            }
        }
    }

    /// Idempotent registration. Sides come from the role map when present;
    /// with no role map configured at all, the first two sessions default to
    /// left and right in registration order.
    pub fn ensure(&mut self, session_id: &str) -> &mut SessionState {
        if !self.sessions.contains_key(session_id) {
            let mut session = SessionState::new(session_id);
            match self.role_map.get(session_id) {
                Some(SessionRole::Player(side)) => {
                    session.side = Some(*side);
                    session.side_authoritative = true;
                }
                Some(SessionRole::Agent) => {}
                None if self.role_map.is_empty() => {
                    let side = if self.order.len() % 2 == 0 {
                        Side::Left
                    } else {
                        Side::Right
                    };
                    session.side = Some(side);
                }
                None => {}
            }
            info!(
                target = "agent.registry",
                session_id,
                side = session.side.map(Side::as_str).unwrap_or("unknown"),
                "registered session"
            );
            self.order.push(session_id.to_string());
            self.sessions.insert(session_id.to_string(), session);
        }
        self.sessions
            .get_mut(session_id)
            .expect("session registered above")
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut SessionState> {
        self.sessions.get_mut(session_id)
    }

    /// Looks a session up by id or by side label.
    pub fn resolve(&self, identifier: &str) -> Option<&SessionState> {
        if let Some(session) = self.sessions.get(identifier) {
            return Some(session);
        }
        let side = Side::parse(identifier)?;
        self.by_side(side)
    }

    pub fn by_side(&self, side: Side) -> Option<&SessionState> {
        self.iter().find(|session| session.side == Some(side))
    }

    pub fn remove(&mut self, session_id: &str) -> Option<SessionState> {
        self.order.retain(|id| id != session_id);
        self.role_map.remove(session_id);
        self.sessions.remove(session_id)
    }

    /// Sessions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Player sessions (those with a side) in registration order.
    pub fn players(&self) -> impl Iterator<Item = &SessionState> {
        self.iter().filter(|session| session.side.is_some())
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.players()
            .map(|session| session.session_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_sides_without_role_map() {
        let mut registry = SessionRegistry::default();
        assert_eq!(registry.ensure("a").side, Some(Side::Left));
        assert_eq!(registry.ensure("b").side, Some(Side::Right));
        assert_eq!(registry.ensure("c").side, Some(Side::Left));
        // Re-registration is idempotent.
        assert_eq!(registry.ensure("a").side, Some(Side::Left));
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn role_map_sides_are_authoritative() {
        let mut roles = HashMap::new();
        roles.insert("a".to_string(), SessionRole::Player(Side::Right));
        roles.insert("agent".to_string(), SessionRole::Agent);
        let mut registry = SessionRegistry::new(roles);
        assert_eq!(registry.ensure("a").side, Some(Side::Right));
        assert!(registry.ensure("a").side_authoritative);
        // A session outside a non-empty role map gets no heuristic side.
        assert_eq!(registry.ensure("b").side, None);
        assert_eq!(registry.ensure("agent").side, None);
    }

    #[test]
    fn merge_roles_updates_existing_sessions() {
        let mut registry = SessionRegistry::default();
        registry.ensure("a");
        let mut roles = HashMap::new();
        roles.insert("a".to_string(), SessionRole::Player(Side::Right));
        registry.merge_roles(&roles);
        let session = registry.get("a").expect("session");
        assert_eq!(session.side, Some(Side::Right));
        assert!(session.side_authoritative);
    }

    #[test]
    fn resolve_matches_id_then_side() {
        let mut registry = SessionRegistry::default();
        registry.ensure("sess-1");
        registry.ensure("sess-2");
        assert_eq!(
            registry.resolve("sess-2").map(|s| s.session_id.as_str()),
            Some("sess-2")
        );
        assert_eq!(
            registry.resolve("rhs").map(|s| s.session_id.as_str()),
            Some("sess-2")
        );
        assert_eq!(
            registry.resolve("left").map(|s| s.session_id.as_str()),
            Some("sess-1")
        );
        assert!(registry.resolve("nope").is_none());
    }

    #[test]
    fn normalizes_transport_status_variants() {
        assert_eq!(
            TransportStatus::from_label(Some("FastPath")),
            TransportStatus::FastPath
        );
        assert_eq!(
            TransportStatus::from_label(Some("httpfallback")),
            TransportStatus::HttpFallback
        );
        assert_eq!(
            TransportStatus::from_label(Some("HTTP")),
            TransportStatus::HttpPoller
        );
        assert_eq!(
            TransportStatus::from_label(Some("pb-controller")),
            TransportStatus::FastPath
        );
        assert_eq!(TransportStatus::from_label(None), TransportStatus::Pending);
        assert_eq!(
            TransportStatus::from_label(Some("")),
            TransportStatus::Pending
        );
    }

    #[test]
    fn stale_frames_never_regress_state() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();
        let session = registry.ensure("a");
        let newer = TerminalFrame {
            sequence: 5,
            lines: vec!["  #  ".into()],
            cursor: None,
        };
        assert!(session.apply_frame(newer, now));
        let stale = TerminalFrame {
            sequence: 3,
            lines: vec!["     ".into()],
            cursor: Some((0, 0)),
        };
        assert!(!session.apply_frame(stale, now + Duration::from_millis(10)));
        assert_eq!(session.last_sequence, 5);
        assert_eq!(session.lines, vec!["  #  ".to_string()]);
        assert!(session.cursor.is_none());
        assert!(session.paddle.is_some());
    }
}
