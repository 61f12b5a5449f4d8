//! Fallback state poller: fetches the latest snapshot on an adjustable
//! cadence. Supplements the stream; sequence gating in the registry makes
//! the race between the two harmless.

use std::time::Duration;

use manager_client::ManagerClient;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::debug;

use super::sleep_unless_stopped;
use crate::events::{AgentEvent, FrameOrigin};

pub async fn run(
    client: ManagerClient,
    session_id: String,
    events: UnboundedSender<AgentEvent>,
    mut stop: watch::Receiver<bool>,
    interval: watch::Receiver<Duration>,
) {
    loop {
        // Interval updates (e.g. from pairing cadence changes) apply on the
        // next cycle without restarting the actor.
        let wait = *interval.borrow();
        if sleep_unless_stopped(&mut stop, wait).await {
            break;
        }
        match client.latest_state(&session_id).await {
            Ok(Some(diff)) => {
                if events
                    .send(AgentEvent::Frame {
                        session_id: session_id.clone(),
                        origin: FrameOrigin::Poll,
                        diff,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                let _ = events.send(AgentEvent::Warn(format!(
                    "state poll failed ({session_id}): {err}"
                )));
            }
        }
    }
    debug!(target = "agent.poller", session_id = %session_id, "state poller stopped");
}
