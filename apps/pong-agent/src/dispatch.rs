//! Command dispatcher: wraps gated commands in action envelopes and delivers
//! them over the configured transports.
//!
//! The remote HTTP action endpoint is the primary transport; a raw TCP
//! JSON-lines sink and an append-only log file are best-effort secondaries.
//! Delivery outcomes are reported back to the control loop as events — the
//! dispatcher itself never touches scheduler or registry state.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use manager_client::{ActionCommand, ManagerClient};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::config::HostPort;
use crate::events::{AgentEvent, DispatchOutcome};

/// Controller tokens by session, with a default fallback. Owned and mutated
/// by the control loop; the dispatcher receives resolved tokens per call.
#[derive(Debug, Default)]
pub struct TokenBook {
    session_tokens: HashMap<String, String>,
    default_token: Option<String>,
}

impl TokenBook {
    pub fn new(session_tokens: HashMap<String, String>, default_token: Option<String>) -> Self {
        Self {
            session_tokens,
            default_token,
        }
    }

    pub fn set_session_token(&mut self, session_id: impl Into<String>, token: impl Into<String>) {
        self.session_tokens.insert(session_id.into(), token.into());
    }

    /// Stores a token only if the session has none yet.
    pub fn set_session_token_default(&mut self, session_id: &str, token: &str) {
        self.session_tokens
            .entry(session_id.to_string())
            .or_insert_with(|| token.to_string());
    }

    pub fn set_default_token(&mut self, token: Option<String>) {
        self.default_token = token;
    }

    pub fn token_for(&self, session_id: &str) -> Option<String> {
        self.session_tokens
            .get(session_id)
            .cloned()
            .or_else(|| self.default_token.clone())
    }

    pub fn has_token(&self, session_id: &str) -> bool {
        self.token_for(session_id).is_some()
    }
}

/// JSON line written to the log file and TCP sink for each action.
pub fn action_record(session_id: &str, action: &ActionCommand) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    serde_json::json!({
        "session_id": session_id,
        "action": action,
        "timestamp": timestamp,
    })
    .to_string()
}

pub struct Dispatcher {
    client: Option<ManagerClient>,
    events: UnboundedSender<AgentEvent>,
    sink: Option<Arc<Mutex<Option<TcpStream>>>>,
    log: Option<Arc<Mutex<File>>>,
}

impl Dispatcher {
    pub fn new(
        client: Option<ManagerClient>,
        events: UnboundedSender<AgentEvent>,
        target: Option<&HostPort>,
        log_path: Option<&PathBuf>,
    ) -> Self {
        let sink = target.and_then(|target| {
            match TcpStream::connect((target.host.as_str(), target.port)) {
                Ok(stream) => Some(Arc::new(Mutex::new(Some(stream)))),
                Err(err) => {
                    warn!(
                        target = "agent.dispatch",
                        host = %target.host,
                        port = target.port,
                        error = %err,
                        "failed to connect action sink"
                    );
                    None
                }
            }
        });
        let log = log_path.and_then(|path| {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Arc::new(Mutex::new(file))),
                Err(err) => {
                    warn!(
                        target = "agent.dispatch",
                        path = %path.display(),
                        error = %err,
                        "failed to open action log"
                    );
                    None
                }
            }
        });
        Self {
            client,
            events,
            sink,
            log,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.client.is_some()
    }

    /// Delivers one command. The HTTP outcome arrives asynchronously as a
    /// `Dispatch` event; purely local delivery reports immediately.
    pub fn dispatch(
        &self,
        session_id: &str,
        command: &str,
        token: Option<String>,
        trace_id: Option<String>,
    ) {
        let action = ActionCommand::terminal_write(format!("{command}\n"), trace_id.clone());
        let record = action_record(session_id, &action);
        let mut transport: &'static str = "log";
        self.write_log(&record);
        if self.write_sink(&record) {
            transport = "pipe";
        }
        debug!(
            target = "agent.dispatch",
            session_id,
            command,
            "action recorded"
        );

        let Some(client) = self.client.clone() else {
            self.report(DispatchOutcome {
                session_id: session_id.to_string(),
                command: command.to_string(),
                accepted: true,
                transport,
                status: None,
                detail: None,
            });
            return;
        };

        let Some(token) = token else {
            warn!(
                target = "agent.dispatch",
                session_id, "no controller token configured; skipping queue_actions"
            );
            self.report(DispatchOutcome {
                session_id: session_id.to_string(),
                command: command.to_string(),
                accepted: false,
                transport: "http",
                status: None,
                detail: Some("missing controller token".into()),
            });
            return;
        };

        let events = self.events.clone();
        let session_id = session_id.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            let result = client
                .queue_actions(
                    &session_id,
                    &token,
                    std::slice::from_ref(&action),
                    trace_id.as_deref(),
                )
                .await;
            let outcome = match result {
                Ok(()) => DispatchOutcome {
                    session_id,
                    command,
                    accepted: true,
                    transport: "http",
                    status: None,
                    detail: None,
                },
                Err(err) => DispatchOutcome {
                    session_id,
                    command,
                    accepted: false,
                    transport: "http",
                    status: err.status().map(|s| s.as_u16()),
                    detail: Some(err.to_string()),
                },
            };
            let _ = events.send(AgentEvent::Dispatch(outcome));
        });
    }

    fn report(&self, outcome: DispatchOutcome) {
        let _ = self.events.send(AgentEvent::Dispatch(outcome));
    }

    fn write_log(&self, record: &str) -> bool {
        let Some(log) = &self.log else {
            return false;
        };
        let mut file = log.lock();
        if let Err(err) = writeln!(file, "{record}").and_then(|_| file.flush()) {
            warn!(target = "agent.dispatch", error = %err, "action log write failed");
            return false;
        }
        true
    }

    fn write_sink(&self, record: &str) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };
        let mut guard = sink.lock();
        let Some(stream) = guard.as_mut() else {
            return false;
        };
        if let Err(err) = stream
            .write_all(record.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
        {
            warn!(
                target = "agent.dispatch",
                error = %err,
                "action sink write failed; disabling forwarder"
            );
            *guard = None;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_book_prefers_session_over_default() {
        let mut book = TokenBook::new(HashMap::new(), Some("default".into()));
        assert_eq!(book.token_for("sess-1").as_deref(), Some("default"));
        book.set_session_token("sess-1", "specific");
        assert_eq!(book.token_for("sess-1").as_deref(), Some("specific"));
        book.set_session_token_default("sess-1", "ignored");
        assert_eq!(book.token_for("sess-1").as_deref(), Some("specific"));
        book.set_default_token(None);
        assert!(book.token_for("sess-2").is_none());
    }

    #[test]
    fn action_record_carries_envelope() {
        let action = ActionCommand::terminal_write("b 5.0 20.0 -3.0\n", None);
        let record = action_record("sess-9", &action);
        let value: serde_json::Value = serde_json::from_str(&record).expect("json line");
        assert_eq!(value["session_id"], "sess-9");
        assert_eq!(value["action"]["action_type"], "terminal_write");
        assert_eq!(value["action"]["payload"]["bytes"], "b 5.0 20.0 -3.0\n");
        assert!(value["timestamp"].as_f64().expect("ts") > 0.0);
    }
}
