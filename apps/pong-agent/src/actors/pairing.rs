//! Pairing watcher: follows controller pairing changes so the control loop
//! can start, retune, or tear down per-child actors.

use std::time::Duration;

use manager_client::ManagerClient;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::debug;

use super::sleep_unless_stopped;
use crate::events::AgentEvent;

const ERROR_RETRY: Duration = Duration::from_secs(2);
const REOPEN_DELAY: Duration = Duration::from_secs(1);

pub async fn run(
    client: ManagerClient,
    controller_session_id: String,
    events: UnboundedSender<AgentEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let mut stream = match client.pairing_stream(&controller_session_id) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = events.send(AgentEvent::Warn(format!(
                    "pairing stream error ({controller_session_id}): {err}"
                )));
                if sleep_unless_stopped(&mut stop, ERROR_RETRY).await {
                    break;
                }
                continue;
            }
        };
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(
                            target = "agent.pairing",
                            controller_session_id = %controller_session_id,
                            "pairing watcher stopped"
                        );
                        return;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if events.send(AgentEvent::Pairing(event)).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = events.send(AgentEvent::Warn(format!(
                            "pairing stream error ({controller_session_id}): {err}"
                        )));
                        if sleep_unless_stopped(&mut stop, ERROR_RETRY).await {
                            return;
                        }
                        break;
                    }
                    None => {
                        if sleep_unless_stopped(&mut stop, REOPEN_DELAY).await {
                            return;
                        }
                        break;
                    }
                },
            }
        }
    }
}
