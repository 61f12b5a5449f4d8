//! Autopilot controller: serve timing, ball handoff between sides, scoring,
//! and paddle tracking.
//!
//! Each tick produces a batch of command requests; the control loop runs
//! every request through the scheduler gate before dispatching, so decisions
//! here stay pure over registry state.

use std::collections::HashMap;
use std::time::Instant;

use rand::Rng;
use tracing::{info, warn};

use crate::config::{AutopilotSettings, ServePreference};
use crate::registry::{SessionRegistry, SessionRole, Side};

/// Lead factor applied to the ball's vertical velocity when targeting.
const TRACKING_LEAD_SECS: f64 = 0.25;
/// Rows kept clear of the field edges when spawning a ball.
const SPAWN_MARGIN: f64 = 3.0;
/// Assumed field height when a session has not rendered yet.
const MIN_FIELD_HEIGHT: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Serve,
    Move,
}

/// One decision awaiting the scheduler gate.
#[derive(Debug, Clone, PartialEq)]
pub struct AutopilotCommand {
    pub session_id: String,
    pub command: String,
    pub kind: CommandKind,
}

pub struct Autopilot {
    settings: AutopilotSettings,
    pub enabled: bool,
    last_spawn: Option<Instant>,
    last_server: Option<Side>,
    /// Console-requested serve target (session id or side), served next tick.
    pending_serve: Option<Option<String>>,
    /// Configured first-serve side, consumed by the first automatic serve.
    initial_side: Option<Side>,
    score: HashMap<Side, u32>,
}

impl Autopilot {
    pub fn new(settings: AutopilotSettings) -> Self {
        let initial_side = settings.forced_serve_side;
        Self {
            settings,
            enabled: true,
            last_spawn: None,
            last_server: None,
            pending_serve: None,
            initial_side,
            score: HashMap::new(),
        }
    }

    pub fn score(&self, side: Side) -> u32 {
        self.score.get(&side).copied().unwrap_or(0)
    }

    /// Queues an operator-requested serve for the next tick. `target` may be
    /// a session id or a side label; `None` serves to a random side.
    pub fn request_serve(&mut self, target: Option<String>) {
        self.pending_serve = Some(target);
    }

    pub fn tick(&mut self, registry: &mut SessionRegistry, now: Instant) -> Vec<AutopilotCommand> {
        let mut commands = Vec::new();
        self.handle_ball_exits(registry, now, &mut commands);
        self.maybe_serve(registry, now, &mut commands);
        self.drive_paddles(registry, now, &mut commands);
        commands
    }

    // ------------------------------------------------------------- handoff

    fn handle_ball_exits(
        &mut self,
        registry: &mut SessionRegistry,
        now: Instant,
        commands: &mut Vec<AutopilotCommand>,
    ) {
        for session_id in registry.ids() {
            let (side, last_row, last_velocity) = {
                let Some(session) = registry.get_mut(&session_id) else {
                    continue;
                };
                if !session.ball.exit_pending() {
                    continue;
                }
                session.ball.take_exit();
                let Some(side) = session.side else {
                    continue;
                };
                (side, session.ball.last_row(), session.ball.last_velocity)
            };

            let target_side = side.opposite();
            let target_id = registry
                .by_side(target_side)
                .map(|session| session.session_id.clone())
                .or_else(|| {
                    // The receiving session may not have produced a frame
                    // yet; fall back to the authoritative role map.
                    let mapped = registry
                        .role_map()
                        .iter()
                        .find(|(_, role)| **role == SessionRole::Player(target_side))
                        .map(|(id, _)| id.clone())?;
                    registry.ensure(&mapped);
                    Some(mapped)
                });
            let Some(target_id) = target_id else {
                warn!(
                    target = "agent.autopilot",
                    from = side.as_str(),
                    "ball exit with no session available on the receiving side"
                );
                continue;
            };

            let target = registry.ensure(&target_id);
            let spawn_row = last_row
                .or(target.paddle.map(|paddle| paddle.center))
                .unwrap_or_else(|| (target.height() as f64 / 2.0).max(SPAWN_MARGIN));
            let upper = (target.height() as f64 - SPAWN_MARGIN).max(SPAWN_MARGIN);
            let spawn_row = spawn_row.clamp(SPAWN_MARGIN, upper);

            let mut rng = rand::thread_rng();
            let dx_mag = rng.gen_range(self.settings.serve_dx.0..=self.settings.serve_dx.1);
            let dx = match target_side {
                Side::Right => dx_mag,
                Side::Left => -dx_mag,
            };
            let mut dy = rng.gen_range(self.settings.serve_dy.0..=self.settings.serve_dy.1);
            if let Some((_, vy)) = last_velocity {
                if vy < 0.0 {
                    dy = -dy.abs();
                } else if vy > 0.0 {
                    dy = dy.abs();
                }
            }

            commands.push(AutopilotCommand {
                session_id: target_id,
                command: format!("b {spawn_row:.1} {dx:.1} {dy:.1}"),
                kind: CommandKind::Serve,
            });
            self.last_spawn = Some(now);
            *self.score.entry(target_side).or_insert(0) += 1;
            info!(
                target = "agent.autopilot",
                lhs = self.score(Side::Left),
                rhs = self.score(Side::Right),
                "score update"
            );
        }
    }

    // --------------------------------------------------------------- serve

    fn maybe_serve(
        &mut self,
        registry: &mut SessionRegistry,
        now: Instant,
        commands: &mut Vec<AutopilotCommand>,
    ) {
        let forced = self.pending_serve.take();
        // An explicit target bypasses the cadence checks; a bare serve
        // request (or the automatic path) respects them.
        if !matches!(&forced, Some(Some(_))) {
            let due = self
                .last_spawn
                .is_none_or(|at| now.saturating_duration_since(at) >= self.settings.serve_interval);
            if !due {
                return;
            }
            let in_flight = registry
                .iter()
                .any(|session| session.ball.position.is_some());
            if in_flight {
                return;
            }
        }

        let target_id = match forced {
            Some(Some(identifier)) => match registry.resolve(&identifier) {
                Some(session) => Some(session.session_id.clone()),
                None => {
                    warn!(
                        target = "agent.autopilot",
                        identifier = %identifier, "serve requested for unknown session"
                    );
                    return;
                }
            },
            _ => None,
        };

        let (session_id, side) = match target_id {
            Some(session_id) => {
                let side = registry.get(&session_id).and_then(|s| s.side);
                (session_id, side)
            }
            None => {
                let candidates: Vec<(Side, String)> = registry
                    .players()
                    .filter(|session| session.height() > 0)
                    .filter_map(|session| {
                        session.side.map(|side| (side, session.session_id.clone()))
                    })
                    .collect();
                if candidates.is_empty() {
                    return;
                }
                let side = self.choose_serve_side(&candidates);
                let Some((_, session_id)) = candidates
                    .iter()
                    .find(|(candidate, _)| *candidate == side)
                else {
                    return;
                };
                (session_id.clone(), Some(side))
            }
        };

        let session = registry.ensure(&session_id);
        let height = (session.height() as f64).max(MIN_FIELD_HEIGHT);
        let upper = (height - SPAWN_MARGIN).max(SPAWN_MARGIN + 1.0);
        let mut rng = rand::thread_rng();
        let spawn_row = rng.gen_range(SPAWN_MARGIN..upper);
        let dx = rng.gen_range(self.settings.serve_dx.0..=self.settings.serve_dx.1);
        let dy = rng.gen_range(self.settings.serve_dy.0..=self.settings.serve_dy.1);

        commands.push(AutopilotCommand {
            session_id,
            command: format!("b {spawn_row:.1} {dx:.1} {dy:.1}"),
            kind: CommandKind::Serve,
        });
        self.last_spawn = Some(now);
        self.last_server = side.or(self.last_server);
    }

    fn choose_serve_side(&mut self, candidates: &[(Side, String)]) -> Side {
        let available: Vec<Side> = candidates.iter().map(|(side, _)| *side).collect();
        let pick_random = |rng: &mut rand::rngs::ThreadRng| -> Side {
            available[rng.gen_range(0..available.len())]
        };
        let mut rng = rand::thread_rng();
        let preferred = match self.initial_side.take() {
            Some(side) => Some(side),
            None => match self.settings.serve_preference {
                ServePreference::Left => Some(Side::Left),
                ServePreference::Right => Some(Side::Right),
                ServePreference::Alternate => self.last_server.map(Side::opposite),
                ServePreference::Random => None,
            },
        };
        match preferred {
            Some(side) if available.contains(&side) => side,
            _ => pick_random(&mut rng),
        }
    }

    // ------------------------------------------------------------ tracking

    fn drive_paddles(
        &mut self,
        registry: &SessionRegistry,
        now: Instant,
        commands: &mut Vec<AutopilotCommand>,
    ) {
        for session in registry.players() {
            let Some(paddle) = session.paddle else {
                continue;
            };
            let Some((ball_row, _)) = session.ball.position else {
                continue;
            };
            if session
                .last_command
                .is_some_and(|at| now.saturating_duration_since(at) < self.settings.command_interval)
            {
                continue;
            }
            let lead = session
                .ball
                .velocity
                .map(|(_, vy)| vy * TRACKING_LEAD_SECS)
                .unwrap_or(0.0);
            let target_row = ball_row + lead;
            let delta = paddle.center - target_row;
            if delta.abs() < self.settings.min_threshold {
                continue;
            }
            let clamped = delta.clamp(-self.settings.max_step, self.settings.max_step);
            tracing::debug!(
                target = "agent.autopilot",
                session_id = %session.session_id,
                column = paddle.column,
                delta = clamped,
                "tracking ball"
            );
            commands.push(AutopilotCommand {
                session_id: session.session_id.clone(),
                command: format!("m {clamped:.2}"),
                kind: CommandKind::Move,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::BALL_LOSS_GRACE;
    use std::time::Duration;

    fn settings() -> AutopilotSettings {
        AutopilotSettings {
            serve_interval: Duration::from_secs(0),
            serve_dx: (18.0, 26.0),
            serve_dy: (-8.0, 8.0),
            serve_preference: ServePreference::Random,
            forced_serve_side: None,
            max_step: 2.5,
            min_threshold: 0.4,
            command_interval: Duration::from_millis(80),
        }
    }

    fn registry_with_players() -> SessionRegistry {
        let mut registry = SessionRegistry::default();
        registry.ensure("sess-l").lines = vec![" ".repeat(40); 24];
        registry.ensure("sess-r").lines = vec![" ".repeat(40); 24];
        registry
    }

    fn parse_ball_command(command: &str) -> (f64, f64, f64) {
        let parts: Vec<&str> = command.split_whitespace().collect();
        assert_eq!(parts[0], "b", "expected ball command, got {command}");
        (
            parts[1].parse().expect("row"),
            parts[2].parse().expect("dx"),
            parts[3].parse().expect("dy"),
        )
    }

    #[test]
    fn ball_exit_hands_off_to_opposite_side_and_scores() {
        let mut registry = registry_with_players();
        let start = Instant::now();
        {
            let lhs = registry.get_mut("sess-l").expect("lhs");
            lhs.ball.observe(Some((7.0, 4.0)), start);
            lhs.ball.observe(Some((6.0, 2.0)), start + Duration::from_millis(100));
            lhs.ball
                .observe(None, start + BALL_LOSS_GRACE + Duration::from_millis(200));
            assert!(lhs.ball.exit_pending());
        }

        let mut pilot = Autopilot::new(settings());
        let now = start + BALL_LOSS_GRACE + Duration::from_millis(300);
        let commands = pilot.tick(&mut registry, now);

        let serve = commands
            .iter()
            .find(|cmd| cmd.kind == CommandKind::Serve)
            .expect("handoff serve");
        assert_eq!(serve.session_id, "sess-r");
        let (row, dx, dy) = parse_ball_command(&serve.command);
        // Into the right side means strictly positive horizontal velocity.
        assert!(dx > 0.0, "dx should point into the receiver, got {dx}");
        // Spawn row comes from the last sighting, clamped to the margin.
        assert!((3.0..=21.0).contains(&row));
        // Vertical direction continues the exiting ball's upward motion.
        assert!(dy <= 0.0, "dy should continue upward motion, got {dy}");
        assert_eq!(pilot.score(Side::Right), 1);
        assert_eq!(pilot.score(Side::Left), 0);

        // The latch fires exactly once: another tick scores nothing new.
        pilot.tick(&mut registry, now + Duration::from_millis(10));
        assert_eq!(pilot.score(Side::Right), 1);
        assert_eq!(pilot.score(Side::Left), 0);
    }

    #[test]
    fn alternate_preference_flips_serving_side() {
        let mut registry = registry_with_players();
        let mut cfg = settings();
        cfg.serve_preference = ServePreference::Alternate;
        let mut pilot = Autopilot::new(cfg);

        let now = Instant::now();
        let first = pilot.tick(&mut registry, now);
        let first_serve = first.first().expect("first serve");
        let first_side = registry
            .get(&first_serve.session_id)
            .and_then(|s| s.side)
            .expect("side");

        let second = pilot.tick(&mut registry, now + Duration::from_secs(1));
        let second_serve = second.first().expect("second serve");
        let second_side = registry
            .get(&second_serve.session_id)
            .and_then(|s| s.side)
            .expect("side");
        assert_eq!(second_side, first_side.opposite());
    }

    #[test]
    fn configured_side_takes_precedence_once() {
        let mut registry = registry_with_players();
        let mut cfg = settings();
        cfg.serve_preference = ServePreference::Left;
        cfg.forced_serve_side = Some(Side::Right);
        let mut pilot = Autopilot::new(cfg);

        let now = Instant::now();
        let first = pilot.tick(&mut registry, now);
        assert_eq!(first.first().expect("serve").session_id, "sess-r");
        // After the forced side is consumed the preference applies.
        let second = pilot.tick(&mut registry, now + Duration::from_secs(1));
        assert_eq!(second.first().expect("serve").session_id, "sess-l");
    }

    #[test]
    fn serve_waits_for_interval_and_clear_field() {
        let mut registry = registry_with_players();
        let mut cfg = settings();
        cfg.serve_interval = Duration::from_secs(3);
        let mut pilot = Autopilot::new(cfg);
        let now = Instant::now();

        assert_eq!(pilot.tick(&mut registry, now).len(), 1);
        // Interval not yet elapsed: no serve.
        assert!(pilot.tick(&mut registry, now + Duration::from_secs(1)).is_empty());
        // Ball in flight: no serve even after the interval.
        registry
            .get_mut("sess-l")
            .expect("lhs")
            .ball
            .observe(Some((5.0, 5.0)), now + Duration::from_secs(3));
        assert!(pilot.tick(&mut registry, now + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn paddle_tracking_respects_threshold_step_and_interval() {
        let mut registry = registry_with_players();
        let mut cfg = settings();
        cfg.serve_interval = Duration::from_secs(3600);
        let mut pilot = Autopilot::new(cfg);
        pilot.last_spawn = Some(Instant::now());
        let now = Instant::now();

        {
            let lhs = registry.get_mut("sess-l").expect("lhs");
            lhs.paddle = Some(crate::perception::PaddleEstimate {
                center: 10.0,
                column: 3,
            });
            lhs.ball.observe(Some((5.0, 8.0)), now);
            lhs.ball.velocity = Some((0.0, -4.0));
        }

        let commands = pilot.tick(&mut registry, now + Duration::from_millis(100));
        let movement = commands.first().expect("move command");
        assert_eq!(movement.kind, CommandKind::Move);
        assert_eq!(movement.session_id, "sess-l");
        // Target is 5 + (-4 * 0.25) = 4; delta 6 clamps to the max step.
        assert_eq!(movement.command, "m 2.50");

        // Inside the per-session command interval nothing is sent.
        registry.get_mut("sess-l").expect("lhs").last_command =
            Some(now + Duration::from_millis(100));
        assert!(pilot
            .tick(&mut registry, now + Duration::from_millis(150))
            .is_empty());

        // Below the threshold nothing is sent either.
        {
            let lhs = registry.get_mut("sess-l").expect("lhs");
            lhs.last_command = None;
            lhs.paddle = Some(crate::perception::PaddleEstimate {
                center: 4.2,
                column: 3,
            });
        }
        assert!(pilot
            .tick(&mut registry, now + Duration::from_millis(300))
            .is_empty());
    }
}
