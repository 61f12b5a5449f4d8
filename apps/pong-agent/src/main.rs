mod actors;
mod app;
mod autopair;
mod autopilot;
mod config;
mod console;
mod dispatch;
mod events;
mod logging;
mod perception;
mod registry;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use manager_client::ManagerClient;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::warn;

use crate::actors::ActorSupervisor;
use crate::app::AgentApp;
use crate::autopair::{Autopair, AutopairSettings};
use crate::autopilot::Autopilot;
use crate::config::{
    parse_session_bindings, parse_token_bindings, resolve_actions_target, AutopilotSettings, Cli,
};
use crate::console::ConsoleCommand;
use crate::dispatch::{Dispatcher, TokenBook};
use crate::events::AgentEvent;
use crate::registry::{SessionRegistry, SessionRole};
use crate::scheduler::CommandScheduler;

/// Throttle for "still waiting on readiness" log lines.
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);
/// Poll cadence for children watched before any pairing metadata arrives.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level, cli.log_file.as_ref()).context("logging setup failed")?;

    let role_map = parse_session_bindings(&cli.sessions);
    let session_tokens =
        parse_token_bindings(&cli.session_tokens).map_err(anyhow::Error::msg)?;
    let actions_target =
        resolve_actions_target(cli.actions_target.as_deref()).map_err(anyhow::Error::msg)?;

    let client = cli
        .manager_url
        .as_ref()
        .map(|url| ManagerClient::new(url.clone(), cli.manager_token.clone()));
    if client.is_none() {
        warn!(target = "agent", "manager URL not configured; commands stay local");
    }

    let autopair = match (&client, !cli.no_auto_pair, &cli.private_beach_id) {
        (Some(client), true, Some(private_beach_id)) => Some(Arc::new(Mutex::new(Autopair::new(
            client.clone(),
            AutopairSettings {
                private_beach_id: private_beach_id.clone(),
                session_tag: cli.session_tag.clone(),
                attempts: cli.discovery_attempts,
                interval: Duration::from_secs_f64(cli.discovery_interval.max(0.1)),
                lease_ttl_ms: cli.lease_ttl_ms,
                lease_reason: cli.lease_reason.clone(),
                pair_template: cli.pair_template.clone(),
                pair_cadence: cli.pair_cadence.into(),
            },
        )))),
        (None, true, _) => {
            warn!(target = "agent", "auto pairing requires --manager-url; disabled");
            None
        }
        (Some(_), true, None) => {
            warn!(target = "agent", "auto pairing requires --private-beach-id; disabled");
            None
        }
        _ => None,
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let (shutdown_tx, _) = watch::channel(false);

    let registry = SessionRegistry::new(role_map.clone());
    let dispatcher = Dispatcher::new(
        client.clone(),
        events_tx.clone(),
        actions_target.as_ref(),
        cli.action_log.as_ref(),
    );
    // Readiness and rate gating only matter when a remote accepts commands.
    let scheduler = CommandScheduler::new(
        dispatcher.has_remote(),
        cli.command_rate,
        Duration::from_secs_f64(cli.readiness_timeout.max(0.1)),
        WAIT_LOG_INTERVAL,
    );
    let autopilot = Autopilot::new(AutopilotSettings::from_cli(&cli));
    let tokens = TokenBook::new(session_tokens, cli.default_controller_token.clone());

    let mut supervisor = client
        .clone()
        .map(|client| ActorSupervisor::new(client, events_tx.clone()));
    match &mut supervisor {
        Some(supervisor) => {
            // Follow configured player sessions right away; discovery adds
            // the rest later. Sorted for a deterministic startup order.
            let mut bound: Vec<&String> = role_map
                .iter()
                .filter(|(_, role)| matches!(role, SessionRole::Player(_)))
                .map(|(session_id, _)| session_id)
                .collect();
            bound.sort();
            for session_id in bound {
                supervisor.watch_child(session_id, DEFAULT_POLL_INTERVAL);
            }
        }
        None => {
            if !role_map.is_empty() {
                warn!(target = "agent", "manager client unavailable; skipping state streams");
            }
        }
    }

    tokio::spawn(console::run_console(
        events_tx.clone(),
        shutdown_tx.subscribe(),
    ));
    {
        let events = events_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = events.send(AgentEvent::Console(ConsoleCommand::Quit));
            }
        });
    }

    let mut app = AgentApp::new(
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
        cli.lease_ttl_ms,
        cli.lease_reason.clone(),
    );
    app.start_discovery();
    app.run().await;
    Ok(())
}
