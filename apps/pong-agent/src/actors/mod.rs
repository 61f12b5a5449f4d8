//! Background actors and their supervisor.
//!
//! Each actor is an independent tokio task that publishes events onto the
//! shared channel and never mutates registry state. The supervisor is owned
//! by the control loop and handles per-child start/stop, live poll-interval
//! updates, and bounded-timeout joins on shutdown.

pub mod lease;
pub mod pairing;
pub mod poller;
pub mod state_stream;

use std::collections::HashMap;
use std::time::Duration;

use manager_client::ManagerClient;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::autopair::MIN_POLL_INTERVAL;
use crate::events::AgentEvent;

/// How long shutdown waits for each actor before abandoning it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Sleeps for `duration`, returning early with `true` when the stop signal
/// fires or its sender is gone.
pub(crate) async fn sleep_unless_stopped(
    stop: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

struct ChildActors {
    stop: watch::Sender<bool>,
    poll_interval: watch::Sender<Duration>,
    stream: JoinHandle<()>,
    poller: JoinHandle<()>,
}

struct SingleActor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ActorSupervisor {
    client: ManagerClient,
    events: UnboundedSender<AgentEvent>,
    children: HashMap<String, ChildActors>,
    lease: Option<SingleActor>,
    pairing: Option<SingleActor>,
}

impl ActorSupervisor {
    pub fn new(client: ManagerClient, events: UnboundedSender<AgentEvent>) -> Self {
        Self {
            client,
            events,
            children: HashMap::new(),
            lease: None,
            pairing: None,
        }
    }

    /// Starts the stream follower and poller for a child session. Idempotent;
    /// re-watching an already-watched child only updates its poll interval.
    pub fn watch_child(&mut self, session_id: &str, poll_interval: Duration) {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        if self.children.contains_key(session_id) {
            self.set_poll_interval(session_id, poll_interval);
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let (interval_tx, interval_rx) = watch::channel(poll_interval);
        let stream = tokio::spawn(state_stream::run(
            self.client.clone(),
            session_id.to_string(),
            self.events.clone(),
            stop_rx.clone(),
        ));
        let poller = tokio::spawn(poller::run(
            self.client.clone(),
            session_id.to_string(),
            self.events.clone(),
            stop_rx,
            interval_rx,
        ));
        self.children.insert(
            session_id.to_string(),
            ChildActors {
                stop: stop_tx,
                poll_interval: interval_tx,
                stream,
                poller,
            },
        );
    }

    /// Adjusts a child's poll cadence without restarting its actors.
    pub fn set_poll_interval(&mut self, session_id: &str, interval: Duration) {
        if let Some(child) = self.children.get(session_id) {
            let _ = child.poll_interval.send(interval.max(MIN_POLL_INTERVAL));
        }
    }

    /// Stops and joins the stream and poller for a child.
    pub async fn drop_child(&mut self, session_id: &str) {
        if let Some(child) = self.children.remove(session_id) {
            let _ = child.stop.send(true);
            join_actor("state_stream", session_id, child.stream).await;
            join_actor("poller", session_id, child.poller).await;
        }
    }

    /// (Re)starts the lease renewer for a controller session.
    pub fn start_lease_renewer(
        &mut self,
        controller_session_id: &str,
        ttl_ms: u64,
        reason: Option<String>,
    ) {
        if let Some(old) = self.lease.take() {
            let _ = old.stop.send(true);
            old.handle.abort();
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(lease::run(
            self.client.clone(),
            controller_session_id.to_string(),
            ttl_ms,
            reason,
            self.events.clone(),
            stop_rx,
        ));
        self.lease = Some(SingleActor {
            stop: stop_tx,
            handle,
        });
    }

    /// (Re)starts the pairing-change watcher for a controller session.
    pub fn start_pairing_watcher(&mut self, controller_session_id: &str) {
        if let Some(old) = self.pairing.take() {
            let _ = old.stop.send(true);
            old.handle.abort();
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(pairing::run(
            self.client.clone(),
            controller_session_id.to_string(),
            self.events.clone(),
            stop_rx,
        ));
        self.pairing = Some(SingleActor {
            stop: stop_tx,
            handle,
        });
    }

    /// Signals every actor to stop and joins each with a bounded timeout.
    pub async fn shutdown(&mut self) {
        for child in self.children.values() {
            let _ = child.stop.send(true);
        }
        if let Some(actor) = &self.lease {
            let _ = actor.stop.send(true);
        }
        if let Some(actor) = &self.pairing {
            let _ = actor.stop.send(true);
        }
        let children: Vec<(String, ChildActors)> = self.children.drain().collect();
        for (session_id, child) in children {
            join_actor("state_stream", &session_id, child.stream).await;
            join_actor("poller", &session_id, child.poller).await;
        }
        if let Some(actor) = self.lease.take() {
            join_actor("lease_renewer", "controller", actor.handle).await;
        }
        if let Some(actor) = self.pairing.take() {
            join_actor("pairing_watcher", "controller", actor.handle).await;
        }
    }
}

async fn join_actor(kind: &str, session_id: &str, mut handle: JoinHandle<()>) {
    if tokio::time::timeout(JOIN_TIMEOUT, &mut handle).await.is_err() {
        handle.abort();
        warn!(
            target = "agent.actors",
            kind, session_id, "actor did not stop in time; aborting"
        );
    }
}
