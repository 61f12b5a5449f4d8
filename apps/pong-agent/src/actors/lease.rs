//! Controller lease renewer: re-acquires the lease at half its remaining
//! TTL and republishes the refreshed token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use manager_client::ManagerClient;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::debug;

use super::sleep_unless_stopped;
use crate::events::AgentEvent;

/// Renewal never waits less than this, even for tiny TTLs.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(5);
/// Retry cadence after a failed renewal.
const FAILURE_RETRY: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub async fn run(
    client: ManagerClient,
    controller_session_id: String,
    ttl_ms: u64,
    reason: Option<String>,
    events: UnboundedSender<AgentEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = Duration::from_millis(ttl_ms / 2).max(MIN_RENEW_INTERVAL);
    loop {
        if sleep_unless_stopped(&mut stop, interval).await {
            break;
        }
        match client
            .acquire_controller_lease(&controller_session_id, Some(ttl_ms), reason.as_deref())
            .await
        {
            Ok(lease) => {
                let remaining_ms = (lease.expires_at_ms - now_ms()).max(0) as u64;
                interval = Duration::from_millis(remaining_ms / 2).max(MIN_RENEW_INTERVAL);
                let _ = events.send(AgentEvent::Info(format!(
                    "controller lease renewed; expires in {:.1}s",
                    remaining_ms as f64 / 1000.0
                )));
                if events.send(AgentEvent::Lease(lease)).is_err() {
                    break;
                }
            }
            Err(err) => {
                interval = FAILURE_RETRY;
                let _ = events.send(AgentEvent::Error(format!(
                    "controller lease renewal failed: {err}"
                )));
            }
        }
    }
    debug!(
        target = "agent.lease",
        controller_session_id = %controller_session_id,
        "controller lease renewer stopped"
    );
}
