//! The control loop: sole owner and mutator of the registry, scheduler, and
//! autopilot state.
//!
//! Every other component communicates with it through the shared event
//! channel, in arrival order. The loop alternates between draining events
//! and running the autopilot tick; it never blocks on the network itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use manager_client::{
    ControllerLease, ControllerPairingAction, ControllerPairingEvent, ManagerClient,
    PairingTransportKind,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actors::ActorSupervisor;
use crate::autopair::{cadence_interval, Autopair, AutopairContext};
use crate::autopilot::{Autopilot, CommandKind};
use crate::console::{ConsoleCommand, TokenTarget};
use crate::dispatch::{Dispatcher, TokenBook};
use crate::events::{AgentEvent, DispatchOutcome, FrameOrigin};
use crate::perception::TerminalFrame;
use crate::registry::{SessionRegistry, Side, TransportStatus};
use crate::scheduler::CommandScheduler;

const TICK: Duration = Duration::from_millis(30);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub struct AgentApp {
    registry: SessionRegistry,
    scheduler: CommandScheduler,
    autopilot: Autopilot,
    dispatcher: Dispatcher,
    tokens: TokenBook,
    client: Option<ManagerClient>,
    supervisor: Option<ActorSupervisor>,
    autopair: Option<Arc<Mutex<Autopair>>>,
    events_rx: UnboundedReceiver<AgentEvent>,
    events_tx: UnboundedSender<AgentEvent>,
    shutdown_tx: watch::Sender<bool>,
    lease_ttl_ms: u64,
    lease_reason: String,
    context: Option<AutopairContext>,
    trace_ids: HashMap<String, String>,
    lease_expires_at_ms: Option<i64>,
    actions_dispatched: u64,
    discovery_task: Option<JoinHandle<()>>,
    discovering: bool,
    quit_requested: bool,
}

impl AgentApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: SessionRegistry,
        scheduler: CommandScheduler,
        autopilot: Autopilot,
        dispatcher: Dispatcher,
        tokens: TokenBook,
        client: Option<ManagerClient>,
        supervisor: Option<ActorSupervisor>,
        autopair: Option<Arc<Mutex<Autopair>>>,
        events_rx: UnboundedReceiver<AgentEvent>,
        events_tx: UnboundedSender<AgentEvent>,
        shutdown_tx: watch::Sender<bool>,
        lease_ttl_ms: u64,
        lease_reason: String,
    ) -> Self {
        Self {
            registry,
            scheduler,
            autopilot,
            dispatcher,
            tokens,
            client,
            supervisor,
            autopair,
            events_rx,
            events_tx,
            shutdown_tx,
            lease_ttl_ms,
            lease_reason,
            context: None,
            trace_ids: HashMap::new(),
            lease_expires_at_ms: None,
            actions_dispatched: 0,
            discovery_task: None,
            discovering: false,
            quit_requested: false,
        }
    }

    /// Kicks off the initial topology discovery in the background.
    pub fn start_discovery(&mut self) {
        self.spawn_discovery("startup");
    }

    pub async fn run(&mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(target = "agent.app", "agent ready");
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                    // Drain whatever else already arrived, preserving order.
                    while let Ok(event) = self.events_rx.try_recv() {
                        self.handle_event(event).await;
                    }
                }
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }
            if self.quit_requested {
                break;
            }
        }
        self.shutdown().await;
    }

    // ------------------------------------------------------------- events

    async fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Frame {
                session_id,
                origin,
                diff,
            } => self.handle_frame(&session_id, origin, diff),
            AgentEvent::Lease(lease) => self.handle_lease(lease),
            AgentEvent::Pairing(event) => self.handle_pairing(event).await,
            AgentEvent::Dispatch(outcome) => self.handle_dispatch(outcome),
            AgentEvent::Console(command) => self.handle_console(command),
            AgentEvent::Discovered(context) => {
                self.discovering = false;
                self.apply_context(*context).await;
            }
            AgentEvent::DiscoveryFailed => {
                self.discovering = false;
                warn!(target = "agent.app", "topology discovery failed; continuing unpaired");
            }
            AgentEvent::Info(message) => info!(target = "agent.app", "{message}"),
            AgentEvent::Warn(message) => warn!(target = "agent.app", "{message}"),
            AgentEvent::Error(message) => error!(target = "agent.app", "{message}"),
        }
    }

    fn handle_frame(&mut self, session_id: &str, origin: FrameOrigin, diff: manager_client::StateDiff) {
        let Some(frame) = TerminalFrame::from_diff(&diff) else {
            debug!(
                target = "agent.app",
                session_id,
                "ignoring non-terminal state payload"
            );
            return;
        };
        let lease_active = self.tokens.has_token(session_id);
        let session = self.registry.ensure(session_id);
        session.lease_active = lease_active;
        if session.transport_status.is_pending() {
            // Live frames prove a working transport even before pairing
            // telemetry names one.
            session.transport_status = match origin {
                FrameOrigin::Stream => TransportStatus::HttpFallback,
                FrameOrigin::Poll => TransportStatus::HttpPoller,
            };
        }
        session.apply_frame(frame, Instant::now());
    }

    fn handle_lease(&mut self, lease: ControllerLease) {
        self.lease_expires_at_ms = Some(lease.expires_at_ms);
        self.tokens.set_default_token(Some(lease.controller_token));
        if let Some(context) = &mut self.context {
            context.lease_expires_at_ms = lease.expires_at_ms;
        }
    }

    async fn handle_pairing(&mut self, event: ControllerPairingEvent) {
        let child = event.child_session_id.clone();
        match event.action {
            ControllerPairingAction::Added | ControllerPairingAction::Updated => {
                let interval = event
                    .pairing
                    .as_ref()
                    .map(|pairing| cadence_interval(pairing.update_cadence))
                    .unwrap_or_else(|| cadence_interval(Default::default()));
                if let Some(supervisor) = &mut self.supervisor {
                    supervisor.watch_child(&child, interval);
                }
                let transport = event
                    .pairing
                    .as_ref()
                    .and_then(|pairing| pairing.transport_status.as_ref())
                    .map(|status| match status.transport {
                        PairingTransportKind::FastPath => TransportStatus::FastPath,
                        PairingTransportKind::HttpFallback => TransportStatus::HttpFallback,
                        PairingTransportKind::Pending => TransportStatus::Pending,
                    });
                let session = self.registry.ensure(&child);
                if let Some(status) = transport {
                    session.transport_status = status;
                }
                info!(
                    target = "agent.app",
                    child = %child,
                    action = ?event.action,
                    "controller pairing updated"
                );
            }
            ControllerPairingAction::Removed => {
                if let Some(supervisor) = &mut self.supervisor {
                    supervisor.drop_child(&child).await;
                }
                self.registry.remove(&child);
                self.scheduler.forget_session(&child);
                self.trace_ids.remove(&child);
                info!(target = "agent.app", child = %child, "controller pairing removed; session torn down");
                // Topology drifted underneath us; try to re-pair.
                self.spawn_discovery("pairing removed");
            }
        }
    }

    fn handle_dispatch(&mut self, outcome: DispatchOutcome) {
        self.actions_dispatched += 1;
        debug!(
            target = "agent.app",
            session_id = %outcome.session_id,
            command = %outcome.command,
            transport = outcome.transport,
            accepted = outcome.accepted,
            "dispatch outcome"
        );
        let conflict = outcome.is_conflict();
        let now = Instant::now();
        let session_id = outcome.session_id.clone();
        let session = self.registry.ensure(&session_id);
        self.scheduler.handle_outcome(session, &outcome, now);
        if conflict {
            // Another controller owns the session; our topology is stale.
            self.spawn_discovery("conflict response from action queue");
        }
    }

    fn handle_console(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Quit => {
                info!(target = "agent.console", "operator shutdown requested");
                self.quit_requested = true;
            }
            ConsoleCommand::Pause => {
                self.autopilot.enabled = false;
                info!(target = "agent.console", "autopilot paused");
            }
            ConsoleCommand::Resume => {
                self.autopilot.enabled = true;
                info!(target = "agent.console", "autopilot resumed");
            }
            ConsoleCommand::Serve(target) => {
                if let Some(identifier) = &target {
                    if self.registry.resolve(identifier).is_none() {
                        warn!(target = "agent.console", identifier = %identifier, "unknown session");
                        return;
                    }
                }
                self.autopilot.request_serve(target);
            }
            ConsoleCommand::Token { target, value } => match target {
                TokenTarget::Default => {
                    let cleared = value.is_none();
                    self.tokens.set_default_token(value);
                    info!(
                        target = "agent.console",
                        "default controller token {}",
                        if cleared { "cleared" } else { "updated" }
                    );
                }
                TokenTarget::Session(identifier) => {
                    let Some(value) = value else { return };
                    match self.registry.resolve(&identifier) {
                        Some(session) => {
                            let session_id = session.session_id.clone();
                            self.tokens.set_session_token(&session_id, value);
                            info!(
                                target = "agent.console",
                                session_id = %session_id,
                                "stored controller token"
                            );
                        }
                        None if Side::parse(&identifier).is_some() => {
                            warn!(
                                target = "agent.console",
                                identifier = %identifier,
                                "no session currently registered for side"
                            );
                        }
                        None => {
                            // Not yet discovered; keep the token for later.
                            self.tokens.set_session_token(&identifier, value);
                            info!(
                                target = "agent.console",
                                identifier = %identifier,
                                "stored token for pending session"
                            );
                        }
                    }
                }
            },
            ConsoleCommand::Move { target, delta } => {
                let Some(session) = self.registry.resolve(&target) else {
                    warn!(target = "agent.console", session = %target, "unknown session");
                    return;
                };
                let session_id = session.session_id.clone();
                let token = self.tokens.token_for(&session_id);
                let trace = self.trace_ids.get(&session_id).cloned();
                self.dispatcher
                    .dispatch(&session_id, &format!("m {delta:.2}"), token, trace);
            }
            ConsoleCommand::Actions => {
                info!(
                    target = "agent.console",
                    count = self.actions_dispatched,
                    lhs = self.autopilot.score(Side::Left),
                    rhs = self.autopilot.score(Side::Right),
                    "actions dispatched"
                );
            }
        }
    }

    // ---------------------------------------------------------- discovery

    fn spawn_discovery(&mut self, reason: &str) {
        let Some(autopair) = self.autopair.clone() else {
            return;
        };
        if self.discovering {
            debug!(target = "agent.app", reason, "discovery already in flight");
            return;
        }
        self.discovering = true;
        info!(target = "agent.app", reason, "starting topology discovery");
        let events = self.events_tx.clone();
        self.discovery_task = Some(tokio::spawn(async move {
            let mut autopair = autopair.lock().await;
            let event = match autopair.run(&events).await {
                Some(context) => AgentEvent::Discovered(Box::new(context)),
                None => AgentEvent::DiscoveryFailed,
            };
            let _ = events.send(event);
        }));
    }

    async fn apply_context(&mut self, context: AutopairContext) {
        // Tear down children that disappeared from the new topology.
        if let Some(previous) = &self.context {
            let stale: Vec<String> = previous
                .child_sessions
                .values()
                .filter(|id| !context.session_roles.contains_key(*id))
                .cloned()
                .collect();
            for session_id in stale {
                if let Some(supervisor) = &mut self.supervisor {
                    supervisor.drop_child(&session_id).await;
                }
                self.registry.remove(&session_id);
                self.scheduler.forget_session(&session_id);
                info!(target = "agent.app", session_id = %session_id, "session left topology; torn down");
            }
        }

        self.registry.merge_roles(&context.session_roles);
        self.tokens
            .set_default_token(Some(context.controller_token.clone()));
        self.lease_expires_at_ms = Some(context.lease_expires_at_ms);
        self.trace_ids.extend(context.trace_ids.clone());

        for (side, child) in &context.child_sessions {
            self.tokens
                .set_session_token_default(child, &context.controller_token);
            let session = self.registry.ensure(child);
            session.lease_active = true;
            debug!(target = "agent.app", child = %child, side = side.as_str(), "tracking child session");
            if let Some(supervisor) = &mut self.supervisor {
                let interval = context
                    .poll_intervals
                    .get(child)
                    .copied()
                    .unwrap_or_else(|| cadence_interval(Default::default()));
                supervisor.watch_child(child, interval);
            }
        }

        if let Some(supervisor) = &mut self.supervisor {
            supervisor.start_lease_renewer(
                &context.controller_session_id,
                self.lease_ttl_ms,
                Some(self.lease_reason.clone()),
            );
            supervisor.start_pairing_watcher(&context.controller_session_id);
        }
        info!(
            target = "agent.app",
            controller = %context.controller_session_id,
            children = context.child_sessions.len(),
            "topology context applied"
        );
        self.context = Some(context);
    }

    // ----------------------------------------------------------------- tick

    fn tick(&mut self, now: Instant) {
        self.expire_lease_if_due();

        for session_id in self.registry.player_ids() {
            let has_token = self.tokens.has_token(&session_id);
            if let Some(session) = self.registry.get_mut(&session_id) {
                session.lease_active = has_token;
            }
        }

        let readiness = self
            .scheduler
            .update_player_readiness(self.registry.players(), now);
        if !readiness.ready {
            debug!(
                target = "agent.app",
                gaps = readiness.missing.len(),
                state = ?self.scheduler.state(),
                "holding autopilot until players are ready"
            );
            return;
        }
        if !self.autopilot.enabled {
            return;
        }

        let commands = self.autopilot.tick(&mut self.registry, now);
        for command in commands {
            let allowed = match self.registry.get(&command.session_id) {
                Some(session) => self.scheduler.allow_command(session, now),
                None => false,
            };
            if !allowed {
                continue;
            }
            let token = self.tokens.token_for(&command.session_id);
            let trace = self.trace_ids.get(&command.session_id).cloned();
            self.dispatcher
                .dispatch(&command.session_id, &command.command, token, trace);
            if command.kind == CommandKind::Move {
                if let Some(session) = self.registry.get_mut(&command.session_id) {
                    session.last_command = Some(now);
                }
            }
        }
    }

    fn expire_lease_if_due(&mut self) {
        let Some(expires_at) = self.lease_expires_at_ms else {
            return;
        };
        if unix_ms() <= expires_at {
            return;
        }
        warn!(
            target = "agent.app",
            "controller lease expired; blocking dispatch until renewed"
        );
        self.lease_expires_at_ms = None;
        self.tokens.set_default_token(None);
    }

    // ------------------------------------------------------------- shutdown

    async fn shutdown(&mut self) {
        info!(target = "agent.app", "shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
        if let Some(supervisor) = &mut self.supervisor {
            supervisor.shutdown().await;
        }
        // Release the controller lease so another controller can take over
        // immediately; failing that, it expires on its own.
        if let (Some(client), Some(context)) = (&self.client, &self.context) {
            let release = client.release_controller_lease(&context.controller_session_id);
            match tokio::time::timeout(RELEASE_TIMEOUT, release).await {
                Ok(Ok(())) => info!(target = "agent.app", "controller lease released"),
                Ok(Err(err)) => {
                    warn!(target = "agent.app", error = %err, "controller lease release failed")
                }
                Err(_) => warn!(target = "agent.app", "controller lease release timed out"),
            }
        }
    }
}
