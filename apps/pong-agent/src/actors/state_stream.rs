//! Long-lived state stream follower for one session.

use std::time::Duration;

use manager_client::ManagerClient;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::debug;

use super::sleep_unless_stopped;
use crate::events::{AgentEvent, FrameOrigin};

const ERROR_RETRY: Duration = Duration::from_secs(2);
const REOPEN_DELAY: Duration = Duration::from_secs(1);

pub async fn run(
    client: ManagerClient,
    session_id: String,
    events: UnboundedSender<AgentEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let mut stream = match client.state_stream(&session_id) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = events.send(AgentEvent::Warn(format!(
                    "state stream error ({session_id}): {err}"
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
                        debug!(target = "agent.stream", session_id = %session_id, "state stream stopped");
                        return;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(diff)) => {
                        if events
                            .send(AgentEvent::Frame {
                                session_id: session_id.clone(),
                                origin: FrameOrigin::Stream,
                                diff,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = events.send(AgentEvent::Warn(format!(
                            "state stream error ({session_id}): {err}"
                        )));
                        if sleep_unless_stopped(&mut stop, ERROR_RETRY).await {
                            return;
                        }
                        break;
                    }
                    None => {
                        // Clean end of stream; re-subscribe after a bounded
                        // delay rather than spinning.
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
