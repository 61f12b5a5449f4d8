//! Frame perception: turns rendered terminal frames into paddle and ball
//! estimates.
//!
//! Everything here is pure state over the character grid; network concerns
//! stay in the actors and transport layers.

use std::time::{Duration, Instant};

use manager_client::StateDiff;

/// Glyphs that render a paddle cell. The player draws ASCII `#`; some
/// harnesses upgrade to a block glyph.
pub const PADDLE_GLYPHS: &[char] = &['#', '█'];

/// Glyphs that render the ball.
pub const BALL_GLYPHS: &[char] = &['o', '●'];

/// How long the ball may be absent from frames before it counts as having
/// left the field. Measured from the last positive sighting, so render
/// flicker on a single frame never triggers an exit.
pub const BALL_LOSS_GRACE: Duration = Duration::from_millis(750);

/// A decoded `terminal_full` frame.
#[derive(Debug, Clone)]
pub struct TerminalFrame {
    pub sequence: u64,
    pub lines: Vec<String>,
    pub cursor: Option<(u16, u16)>,
}

impl TerminalFrame {
    /// Extracts a frame from a state diff. Diffs carrying other payload
    /// types (health, OCR, ...) yield `None` and are skipped upstream.
    pub fn from_diff(diff: &StateDiff) -> Option<Self> {
        let payload = diff.payload.as_object()?;
        if payload.get("type").and_then(|v| v.as_str()) != Some("terminal_full") {
            return None;
        }
        let lines = payload
            .get("lines")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        let cursor = payload.get("cursor").and_then(|v| v.as_object()).and_then(|c| {
            let row = c.get("row").and_then(|v| v.as_u64())?;
            let col = c.get("col").and_then(|v| v.as_u64())?;
            Some((row as u16, col as u16))
        });
        Some(Self {
            sequence: diff.sequence,
            lines,
            cursor,
        })
    }
}

/// Paddle estimate: row centroid of paddle glyphs plus the rounded column
/// average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaddleEstimate {
    pub center: f64,
    pub column: i32,
}

pub fn detect_paddle(lines: &[String]) -> Option<PaddleEstimate> {
    let mut row_sum = 0.0;
    let mut col_sum = 0.0;
    let mut count = 0usize;
    for (row, line) in lines.iter().enumerate() {
        for (col, ch) in line.chars().enumerate() {
            if PADDLE_GLYPHS.contains(&ch) {
                row_sum += row as f64;
                col_sum += col as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        return None;
    }
    Some(PaddleEstimate {
        center: row_sum / count as f64,
        column: (col_sum / count as f64).round() as i32,
    })
}

/// First ball glyph in row-major scan order, as (row, col).
pub fn detect_ball(lines: &[String]) -> Option<(f64, f64)> {
    for (row, line) in lines.iter().enumerate() {
        for (col, ch) in line.chars().enumerate() {
            if BALL_GLYPHS.contains(&ch) {
                return Some((row as f64, col as f64));
            }
        }
    }
    None
}

/// Ball tracking across frames: position, finite-difference velocity, and
/// the grace-period exit latch.
#[derive(Debug, Default, Clone)]
pub struct BallTracker {
    pub position: Option<(f64, f64)>,
    pub velocity: Option<(f64, f64)>,
    /// Velocity from the most recent flight, kept across loss for handoff.
    pub last_velocity: Option<(f64, f64)>,
    previous: Option<((f64, f64), Instant)>,
    last_seen: Option<Instant>,
    exit_pending: bool,
}

impl BallTracker {
    /// Folds one frame's detection result into the tracker. `now` is the
    /// frame arrival instant.
    pub fn observe(&mut self, found: Option<(f64, f64)>, now: Instant) {
        match found {
            Some(position) => {
                if let (Some((prev_row, prev_col)), Some(seen)) = (self.position, self.last_seen) {
                    self.previous = Some(((prev_row, prev_col), seen));
                    let elapsed = now.saturating_duration_since(seen).as_secs_f64();
                    if elapsed > 0.0 {
                        let velocity = (
                            (position.1 - prev_col) / elapsed,
                            (position.0 - prev_row) / elapsed,
                        );
                        self.velocity = Some(velocity);
                        self.last_velocity = Some(velocity);
                    }
                }
                self.position = Some(position);
                self.last_seen = Some(now);
                self.exit_pending = false;
            }
            None => {
                let Some(seen) = self.last_seen else {
                    return;
                };
                if self.position.is_none() {
                    return;
                }
                if now.saturating_duration_since(seen) <= BALL_LOSS_GRACE {
                    // Inside the grace window: hold the last sighting.
                    return;
                }
                if let Some(velocity) = self.velocity {
                    self.last_velocity = Some(velocity);
                }
                // Keep `previous`: the handoff serve spawns at the last
                // known row even though the live estimate is gone.
                self.position = None;
                self.velocity = None;
                self.exit_pending = true;
            }
        }
    }

    /// True when the ball has been declared lost and nobody consumed the
    /// signal yet. Consuming resets the latch; it fires once per loss.
    pub fn take_exit(&mut self) -> bool {
        std::mem::take(&mut self.exit_pending)
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_pending
    }

    /// Row of the ball the last time it was seen in flight, surviving loss.
    pub fn last_row(&self) -> Option<f64> {
        self.position
            .map(|(row, _)| row)
            .or_else(|| self.previous.map(|((row, _), _)| row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn paddle_centroid_averages_rows_and_columns() {
        let lines = frame(&["     ", "  #  ", "  #  ", "  #  ", "     "]);
        let paddle = detect_paddle(&lines).expect("paddle");
        assert_eq!(paddle.center, 2.0);
        assert_eq!(paddle.column, 2);
        assert!(detect_paddle(&frame(&["     "])).is_none());
    }

    #[test]
    fn paddle_accepts_block_glyph_variant() {
        let lines = frame(&["█", "█"]);
        let paddle = detect_paddle(&lines).expect("paddle");
        assert_eq!(paddle.center, 0.5);
    }

    #[test]
    fn ball_scan_finds_first_glyph_in_scan_order() {
        let lines = frame(&["     ", "  ●  ", " o   "]);
        assert_eq!(detect_ball(&lines), Some((1.0, 2.0)));
        assert_eq!(detect_ball(&frame(&["   "])), None);
    }

    #[test]
    fn ball_exit_requires_sustained_absence() {
        let mut tracker = BallTracker::default();
        let start = Instant::now();
        tracker.observe(Some((1.0, 2.0)), start);
        assert!(tracker.position.is_some());

        // One missing sample inside the grace window holds the estimate.
        tracker.observe(None, start + BALL_LOSS_GRACE / 2);
        assert!(!tracker.exit_pending());
        assert!(tracker.position.is_some());

        // Continued absence past the grace window latches the exit once.
        tracker.observe(None, start + BALL_LOSS_GRACE + Duration::from_millis(10));
        assert!(tracker.exit_pending());
        assert!(tracker.position.is_none());
        assert!(tracker.take_exit());
        assert!(!tracker.take_exit());

        // Further absent frames do not re-latch.
        tracker.observe(None, start + BALL_LOSS_GRACE * 3);
        assert!(!tracker.exit_pending());
    }

    #[test]
    fn velocity_is_finite_difference_of_sightings() {
        let mut tracker = BallTracker::default();
        let start = Instant::now();
        tracker.observe(Some((4.0, 10.0)), start);
        assert!(tracker.velocity.is_none());
        tracker.observe(Some((6.0, 14.0)), start + Duration::from_millis(500));
        let (vx, vy) = tracker.velocity.expect("velocity");
        assert!((vx - 8.0).abs() < 1e-9);
        assert!((vy - 4.0).abs() < 1e-9);
    }

    #[test]
    fn frame_decoder_skips_foreign_payload_types() {
        let diff = StateDiff {
            sequence: 9,
            payload: serde_json::json!({"type": "health", "lines": ["x"]}),
        };
        assert!(TerminalFrame::from_diff(&diff).is_none());

        let diff = StateDiff {
            sequence: 9,
            payload: serde_json::json!({
                "type": "terminal_full",
                "lines": ["ab", "cd"],
                "cursor": {"row": 1, "col": 0},
            }),
        };
        let frame = TerminalFrame::from_diff(&diff).expect("frame");
        assert_eq!(frame.lines, vec!["ab".to_string(), "cd".to_string()]);
        assert_eq!(frame.cursor, Some((1, 0)));
    }
}
