//! Operator console: a line-oriented command surface on stdin.
//!
//! The console is just another actor — it parses lines into typed commands
//! and publishes them on the shared channel for the control loop to execute.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::AgentEvent;

/// Target of a `token` console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTarget {
    Default,
    Session(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Pause,
    Resume,
    /// Serve immediately, optionally at a specific session or side.
    Serve(Option<String>),
    /// Set (or clear, when `value` is `None`) a controller token.
    Token {
        target: TokenTarget,
        value: Option<String>,
    },
    /// Manual paddle move for a session or side.
    Move { target: String, delta: f64 },
    /// Report how many actions have been dispatched.
    Actions,
    Quit,
}

impl ConsoleCommand {
    /// Parses one console line. Errors are usage messages for the operator.
    pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(verb) = tokens.first() else {
            return Ok(None);
        };
        match verb.to_ascii_lowercase().as_str() {
            "quit" | "exit" => Ok(Some(ConsoleCommand::Quit)),
            "pause" => Ok(Some(ConsoleCommand::Pause)),
            "resume" => Ok(Some(ConsoleCommand::Resume)),
            "actions" => Ok(Some(ConsoleCommand::Actions)),
            "serve" => Ok(Some(ConsoleCommand::Serve(
                tokens.get(1).map(|t| t.to_string()),
            ))),
            "token" => {
                let Some(target) = tokens.get(1) else {
                    return Err(
                        "usage: token <session|side> <value> | token default <value>".into(),
                    );
                };
                if matches!(*target, "default" | "*") {
                    return Ok(Some(ConsoleCommand::Token {
                        target: TokenTarget::Default,
                        value: tokens.get(2).map(|t| t.to_string()),
                    }));
                }
                let Some(value) = tokens.get(2) else {
                    return Err(
                        "usage: token <session|side> <value> | token default <value>".into(),
                    );
                };
                Ok(Some(ConsoleCommand::Token {
                    target: TokenTarget::Session(target.to_string()),
                    value: Some(value.to_string()),
                }))
            }
            "m" => {
                let (Some(target), Some(raw_delta)) = (tokens.get(1), tokens.get(2)) else {
                    return Err("usage: m <session> <delta>".into());
                };
                let delta: f64 = raw_delta
                    .parse()
                    .map_err(|_| "delta must be numeric".to_string())?;
                Ok(Some(ConsoleCommand::Move {
                    target: target.to_string(),
                    delta,
                }))
            }
            other => Err(format!("unrecognised command '{other}'")),
        }
    }
}

/// Reads operator commands from stdin until shutdown or EOF.
pub async fn run_console(events: UnboundedSender<AgentEvent>, mut stop: watch::Receiver<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                        Ok(Some(command)) => {
                            if events.send(AgentEvent::Console(command)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(usage) => warn!(target = "agent.console", "{usage}"),
                    },
                    Ok(None) => {
                        info!(target = "agent.console", "stdin closed; console stopped");
                        break;
                    }
                    Err(err) => {
                        warn!(target = "agent.console", error = %err, "console read failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_verbs() {
        assert_eq!(ConsoleCommand::parse(""), Ok(None));
        assert_eq!(ConsoleCommand::parse("pause"), Ok(Some(ConsoleCommand::Pause)));
        assert_eq!(
            ConsoleCommand::parse("serve lhs"),
            Ok(Some(ConsoleCommand::Serve(Some("lhs".into()))))
        );
        assert_eq!(
            ConsoleCommand::parse("serve"),
            Ok(Some(ConsoleCommand::Serve(None)))
        );
        assert_eq!(ConsoleCommand::parse("EXIT"), Ok(Some(ConsoleCommand::Quit)));
    }

    #[test]
    fn parses_token_forms() {
        assert_eq!(
            ConsoleCommand::parse("token default abc"),
            Ok(Some(ConsoleCommand::Token {
                target: TokenTarget::Default,
                value: Some("abc".into()),
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("token default"),
            Ok(Some(ConsoleCommand::Token {
                target: TokenTarget::Default,
                value: None,
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("token sess-1 tok"),
            Ok(Some(ConsoleCommand::Token {
                target: TokenTarget::Session("sess-1".into()),
                value: Some("tok".into()),
            }))
        );
        assert!(ConsoleCommand::parse("token").is_err());
        assert!(ConsoleCommand::parse("token sess-1").is_err());
    }

    #[test]
    fn parses_move_and_rejects_bad_delta() {
        assert_eq!(
            ConsoleCommand::parse("m lhs -2.5"),
            Ok(Some(ConsoleCommand::Move {
                target: "lhs".into(),
                delta: -2.5,
            }))
        );
        assert!(ConsoleCommand::parse("m lhs abc").is_err());
        assert!(ConsoleCommand::parse("m lhs").is_err());
        assert!(ConsoleCommand::parse("dance").is_err());
    }
}
