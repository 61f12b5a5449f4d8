//! CLI surface and derived runtime configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use manager_client::ControllerUpdateCadence;

use crate::logging::LogLevel;
use crate::registry::{SessionRole, Side};

pub const DEFAULT_SERVE_INTERVAL_SECS: f64 = 3.0;
pub const DEFAULT_MAX_STEP: f64 = 2.5;
pub const DEFAULT_MIN_THRESHOLD: f64 = 0.4;
pub const DEFAULT_COMMAND_INTERVAL_SECS: f64 = 0.08;

/// Which side serves when no side is forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServePreference {
    Left,
    Right,
    /// Alternate from the last serving side.
    Alternate,
    Random,
}

impl std::fmt::Display for ServePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServePreference::Left => "left",
            ServePreference::Right => "right",
            ServePreference::Alternate => "alternate",
            ServePreference::Random => "random",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PairCadence {
    Fast,
    Balanced,
    Slow,
}

impl std::fmt::Display for PairCadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PairCadence::Fast => "fast",
            PairCadence::Balanced => "balanced",
            PairCadence::Slow => "slow",
        };
        f.write_str(label)
    }
}

impl From<PairCadence> for ControllerUpdateCadence {
    fn from(value: PairCadence) -> Self {
        match value {
            PairCadence::Fast => ControllerUpdateCadence::Fast,
            PairCadence::Balanced => ControllerUpdateCadence::Balanced,
            PairCadence::Slow => ControllerUpdateCadence::Slow,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pong-agent", about = "Autopilot agent for the pong showcase")]
pub struct Cli {
    /// Manager base URL for API calls (e.g. https://manager.example/api).
    #[arg(long, env = "PB_MCP_BASE_URL")]
    pub manager_url: Option<String>,

    /// Bearer token with control scope. Leave unset to skip authorization.
    #[arg(long, env = "PB_MCP_TOKEN")]
    pub manager_token: Option<String>,

    /// Workspace (private beach) identifier used for discovery and pairing.
    #[arg(long, env = "PB_PRIVATE_BEACH_ID")]
    pub private_beach_id: Option<String>,

    /// Metadata tag identifying this agent session.
    #[arg(long, env = "PONG_SESSION_TAG")]
    pub session_tag: Option<String>,

    /// Bind a session to a side (e.g. lhs=sess-1 or sess-1:rhs). May repeat.
    #[arg(long = "session", value_name = "BINDING")]
    pub sessions: Vec<String>,

    /// Override controller token per session (session_id=token). May repeat.
    #[arg(long = "session-token", value_name = "SESSION=TOKEN")]
    pub session_tokens: Vec<String>,

    /// Fallback controller token applied to all sessions unless overridden.
    #[arg(long, env = "PB_CONTROLLER_TOKEN")]
    pub default_controller_token: Option<String>,

    /// Disable automatic discovery/pairing.
    #[arg(long)]
    pub no_auto_pair: bool,

    /// Prompt template to associate with controller pairings.
    #[arg(long)]
    pub pair_template: Option<String>,

    /// Update cadence for controller pairings.
    #[arg(long, value_enum, default_value_t = PairCadence::Balanced)]
    pub pair_cadence: PairCadence,

    /// Controller lease TTL in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub lease_ttl_ms: u64,

    /// Reason string recorded with controller lease requests.
    #[arg(long, default_value = "pong_autopilot")]
    pub lease_reason: String,

    /// Number of discovery polls when auto pairing.
    #[arg(long, default_value_t = 12)]
    pub discovery_attempts: u32,

    /// Seconds between discovery polls.
    #[arg(long, default_value_t = 1.0)]
    pub discovery_interval: f64,

    /// Optional host:port receiving dispatched actions as JSON lines.
    /// `none`/`off` disables the sink.
    #[arg(long)]
    pub actions_target: Option<String>,

    /// Optional path receiving an append-only JSON action log.
    #[arg(long)]
    pub action_log: Option<PathBuf>,

    /// Seconds between automatic ball serves.
    #[arg(long, default_value_t = DEFAULT_SERVE_INTERVAL_SECS)]
    pub serve_interval: f64,

    /// Range for horizontal velocity magnitude when serving.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], default_values_t = [18.0, 26.0])]
    pub serve_dx: Vec<f64>,

    /// Range for vertical velocity component when serving.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], default_values_t = [-8.0, 8.0])]
    pub serve_dy: Vec<f64>,

    /// Which side serves first when none is forced.
    #[arg(long, value_enum, default_value_t = ServePreference::Random)]
    pub serve_preference: ServePreference,

    /// Force the first serve to a specific side.
    #[arg(long, value_parser = parse_side)]
    pub serve_side: Option<Side>,

    /// Maximum paddle move per command.
    #[arg(long, default_value_t = DEFAULT_MAX_STEP)]
    pub max_step: f64,

    /// Ignore paddle adjustments smaller than this delta.
    #[arg(long, default_value_t = DEFAULT_MIN_THRESHOLD)]
    pub min_threshold: f64,

    /// Minimum seconds between paddle commands per session.
    #[arg(long, default_value_t = DEFAULT_COMMAND_INTERVAL_SECS)]
    pub command_interval: f64,

    /// Commands permitted per session per second.
    #[arg(long, default_value_t = 2)]
    pub command_rate: u32,

    /// Seconds a player frame may age before readiness lapses.
    #[arg(long, default_value_t = 2.0)]
    pub readiness_timeout: f64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write logs to a file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

fn parse_side(value: &str) -> Result<Side, String> {
    Side::parse(value).ok_or_else(|| format!("expected lhs|rhs, got '{value}'"))
}

/// Resolves the `--actions-target` value. Empty, `none`, and `off` disable
/// the sink; anything else must be `<host>:<port>`.
pub fn resolve_actions_target(value: Option<&str>) -> Result<Option<HostPort>, String> {
    let Some(value) = value.map(str::trim) else {
        return Ok(None);
    };
    if value.is_empty() || value.eq_ignore_ascii_case("none") || value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| "expected <host>:<port>".to_string())?;
    let port: u16 = port.parse().map_err(|_| format!("invalid port: {port}"))?;
    Ok(Some(HostPort {
        host: host.trim().to_string(),
        port,
    }))
}

/// Parses repeated `--session` bindings. Accepts `lhs=sess`, `sess=lhs`,
/// `sess:lhs`, `lhs:sess`, and bare session ids; bare ids default to
/// alternating sides in argument order.
pub fn parse_session_bindings(values: &[String]) -> HashMap<String, SessionRole> {
    let mut roles: HashMap<String, SessionRole> = HashMap::new();
    let mut assigned = 0usize;
    for raw in values {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }
        let mut side: Option<Side> = None;
        let mut session_id: Option<&str> = None;
        if let Some((left, right)) = item.split_once('=').or_else(|| item.split_once(':')) {
            if let Some(parsed) = Side::parse(left) {
                side = Some(parsed);
                session_id = Some(right.trim());
            } else if let Some(parsed) = Side::parse(right) {
                side = Some(parsed);
                session_id = Some(left.trim());
            }
        }
        let session_id = session_id.filter(|id| !id.is_empty()).unwrap_or(item);
        let side = side.unwrap_or_else(|| {
            if assigned % 2 == 0 {
                Side::Left
            } else {
                Side::Right
            }
        });
        roles.insert(session_id.to_string(), SessionRole::Player(side));
        assigned += 1;
    }
    roles
}

/// Parses repeated `session_id=token` overrides.
pub fn parse_token_bindings(values: &[String]) -> Result<HashMap<String, String>, String> {
    let mut tokens = HashMap::new();
    for raw in values {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| "token mapping must look like session=token".to_string())?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err("token mapping must look like session=token".into());
        }
        tokens.insert(key.to_string(), value.to_string());
    }
    Ok(tokens)
}

fn range_from(values: &[f64], fallback: (f64, f64)) -> (f64, f64) {
    match values {
        [min, max] => (min.min(*max), min.max(*max)),
        _ => fallback,
    }
}

/// Autopilot tuning derived from the CLI.
#[derive(Debug, Clone)]
pub struct AutopilotSettings {
    pub serve_interval: Duration,
    pub serve_dx: (f64, f64),
    pub serve_dy: (f64, f64),
    pub serve_preference: ServePreference,
    pub forced_serve_side: Option<Side>,
    pub max_step: f64,
    pub min_threshold: f64,
    pub command_interval: Duration,
}

impl AutopilotSettings {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            serve_interval: Duration::from_secs_f64(cli.serve_interval.max(0.0)),
            serve_dx: range_from(&cli.serve_dx, (18.0, 26.0)),
            serve_dy: range_from(&cli.serve_dy, (-8.0, 8.0)),
            serve_preference: cli.serve_preference,
            forced_serve_side: cli.serve_side,
            max_step: cli.max_step,
            min_threshold: cli.min_threshold,
            command_interval: Duration::from_secs_f64(cli.command_interval.max(0.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_bindings_accept_all_forms() {
        let roles = parse_session_bindings(&[
            "lhs=sess-1".into(),
            "sess-2=rhs".into(),
            "sess-3:lhs".into(),
            "rhs:sess-4".into(),
        ]);
        assert_eq!(roles.get("sess-1"), Some(&SessionRole::Player(Side::Left)));
        assert_eq!(roles.get("sess-2"), Some(&SessionRole::Player(Side::Right)));
        assert_eq!(roles.get("sess-3"), Some(&SessionRole::Player(Side::Left)));
        assert_eq!(roles.get("sess-4"), Some(&SessionRole::Player(Side::Right)));
    }

    #[test]
    fn bare_session_ids_alternate_sides() {
        let roles = parse_session_bindings(&["sess-a".into(), "sess-b".into()]);
        assert_eq!(roles.get("sess-a"), Some(&SessionRole::Player(Side::Left)));
        assert_eq!(roles.get("sess-b"), Some(&SessionRole::Player(Side::Right)));
    }

    #[test]
    fn token_bindings_require_key_and_value() {
        let tokens =
            parse_token_bindings(&["sess-1=tok-1".into(), " sess-2 = tok-2 ".into()]).expect("ok");
        assert_eq!(tokens.get("sess-1").map(String::as_str), Some("tok-1"));
        assert_eq!(tokens.get("sess-2").map(String::as_str), Some("tok-2"));
        assert!(parse_token_bindings(&["sess-1".into()]).is_err());
        assert!(parse_token_bindings(&["=tok".into()]).is_err());
    }

    #[test]
    fn actions_target_resolution() {
        let target = resolve_actions_target(Some("127.0.0.1:9000"))
            .expect("parse")
            .expect("target");
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 9000);
        assert_eq!(resolve_actions_target(Some("off")), Ok(None));
        assert_eq!(resolve_actions_target(None), Ok(None));
        assert!(resolve_actions_target(Some("nohost")).is_err());
        assert!(resolve_actions_target(Some("host:notaport")).is_err());
    }
}
