//! Topology discovery ("autopair"): works out which sessions are the agent
//! and the paddle children from session metadata and the canvas layout
//! graph, then establishes the lease and pairings.
//!
//! Resolution is deterministic: ties always break by ascending horizontal
//! position, then ascending session id, so repeated discovery over an
//! unchanged layout is idempotent.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use manager_client::{
    CanvasLayout, ControllerUpdateCadence, ManagerClient, SessionSummary,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::events::AgentEvent;
use crate::registry::{SessionRole, Side};

/// Floor for poll cadences resolved from pairing metadata.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

const LAYOUT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Result of a successful discovery run. Replaced wholesale on each
/// re-discovery; sessions absent from the new context are torn down.
#[derive(Debug, Clone)]
pub struct AutopairContext {
    pub controller_session_id: String,
    pub controller_token: String,
    pub lease_expires_at_ms: i64,
    pub child_sessions: HashMap<Side, String>,
    pub session_roles: HashMap<String, SessionRole>,
    pub poll_intervals: HashMap<String, Duration>,
    pub trace_ids: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AutopairSettings {
    pub private_beach_id: String,
    pub session_tag: Option<String>,
    pub attempts: u32,
    pub interval: Duration,
    pub lease_ttl_ms: u64,
    pub lease_reason: String,
    pub pair_template: Option<String>,
    pub pair_cadence: ControllerUpdateCadence,
}

pub fn cadence_interval(cadence: ControllerUpdateCadence) -> Duration {
    match cadence {
        ControllerUpdateCadence::Fast => Duration::from_millis(250),
        ControllerUpdateCadence::Balanced => Duration::from_secs(1),
        ControllerUpdateCadence::Slow => Duration::from_secs(3),
    }
}

/// Short-TTL canvas layout cache keyed by workspace id, owned by discovery.
struct LayoutCache {
    entry: Option<(String, Instant, CanvasLayout)>,
}

impl LayoutCache {
    fn new() -> Self {
        Self { entry: None }
    }

    async fn fetch(
        &mut self,
        client: &ManagerClient,
        workspace: &str,
    ) -> Result<CanvasLayout, manager_client::ManagerError> {
        if let Some((cached_workspace, fetched_at, layout)) = &self.entry {
            if cached_workspace == workspace && fetched_at.elapsed() < LAYOUT_CACHE_TTL {
                return Ok(layout.clone());
            }
        }
        let layout = client.canvas_layout(workspace).await?;
        self.entry = Some((workspace.to_string(), Instant::now(), layout.clone()));
        Ok(layout)
    }
}

/// Side and role assignments worked out from one summaries+layout snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyPlan {
    pub agent_session_id: String,
    pub sides: Vec<(Side, String)>,
    /// Children whose side was inferred (not declared in session metadata);
    /// discovery tags these back into session metadata.
    pub inferred: Vec<(String, Side)>,
    pub poll_intervals: HashMap<String, Duration>,
    pub trace_ids: HashMap<String, String>,
}

fn meta_str(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Pure resolution step: no network, fully deterministic over its inputs.
pub fn resolve_topology(
    summaries: &[SessionSummary],
    layout: &CanvasLayout,
    session_tag: Option<&str>,
) -> Option<TopologyPlan> {
    // Index the layout: tile id -> (x, metadata), session id -> tile id.
    let mut tile_meta: HashMap<&str, (f64, serde_json::Map<String, Value>)> = HashMap::new();
    let mut session_tile: HashMap<String, &str> = HashMap::new();
    let mut tile_session: HashMap<&str, String> = HashMap::new();
    for (tile_id, tile) in &layout.tiles {
        let meta = tile.metadata_object();
        if let Some(bound) = meta_str(&meta, "sessionId") {
            session_tile.insert(bound.clone(), tile_id.as_str());
            tile_session.insert(tile_id.as_str(), bound);
        }
        tile_meta.insert(tile_id.as_str(), (tile.position.x, meta));
    }

    // Relationship index: agent tile -> related child tiles.
    let mut related: HashMap<&str, Vec<&str>> = HashMap::new();
    for rel in layout.metadata.agent_relationships.values() {
        related
            .entry(rel.source_id.as_str())
            .or_default()
            .push(rel.target_id.as_str());
    }

    let mut agent_session: Option<String> = None;
    let mut sides: HashMap<Side, String> = HashMap::new();
    let mut fallback: Vec<String> = Vec::new();
    for summary in summaries {
        let session_id = summary.session_id.as_str();
        let meta = summary.metadata_object();
        let tile = session_tile.get(session_id).copied();
        let tile_info = tile.and_then(|id| tile_meta.get(id));

        let declared = meta_str(&meta, "pong_role")
            .or_else(|| tile_info.and_then(|(_, m)| meta_str(m, "pongRole")))
            .and_then(|value| SessionRole::parse(&value));
        let node_type = tile_info.and_then(|(_, m)| meta_str(m, "nodeType"));
        let role = declared.or(match node_type.as_deref() {
            Some("agent") => Some(SessionRole::Agent),
            _ => None,
        });

        match role {
            Some(SessionRole::Player(side)) => {
                sides.entry(side).or_insert_with(|| session_id.to_string());
            }
            Some(SessionRole::Agent) => {
                let tag = meta_str(&meta, "pong_tag")
                    .or_else(|| tile_info.and_then(|(_, m)| meta_str(m, "pongTag")));
                match session_tag {
                    None => {
                        if agent_session.is_none() {
                            agent_session = Some(session_id.to_string());
                        }
                    }
                    Some(wanted) => {
                        if tag.as_deref() == Some(wanted) {
                            agent_session = Some(session_id.to_string());
                        }
                    }
                }
            }
            None => {
                if node_type.as_deref() == Some("application") {
                    fallback.push(session_id.to_string());
                }
            }
        }
    }

    let agent_session_id = agent_session?;
    let mut used: HashSet<String> = sides.values().cloned().collect();
    used.insert(agent_session_id.clone());
    let mut inferred: Vec<(String, Side)> = Vec::new();

    // Resolve remaining sides from relationship edges, ordered by the
    // children's horizontal position relative to the agent tile.
    let agent_tile = session_tile.get(agent_session_id.as_str()).copied();
    if sides.len() < 2 {
        if let Some(agent_tile) = agent_tile {
            let agent_x = tile_meta
                .get(agent_tile)
                .map(|(x, _)| *x)
                .unwrap_or_default();
            let mut candidates: Vec<(f64, String)> = related
                .get(agent_tile)
                .into_iter()
                .flatten()
                .filter_map(|child_tile| {
                    let session = tile_session.get(child_tile)?;
                    if used.contains(session) {
                        return None;
                    }
                    let x = tile_meta.get(child_tile).map(|(x, _)| *x)?;
                    Some((x, session.clone()))
                })
                .collect();
            candidates.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });
            candidates.dedup_by(|a, b| a.1 == b.1);

            for side in [Side::Left, Side::Right] {
                if sides.contains_key(&side) {
                    continue;
                }
                let preferred = candidates.iter().find(|(x, session)| {
                    !used.contains(session)
                        && match side {
                            Side::Left => *x < agent_x,
                            Side::Right => *x > agent_x,
                        }
                });
                let chosen = preferred.or_else(|| {
                    candidates.iter().find(|(_, session)| !used.contains(session))
                });
                if let Some((_, session)) = chosen {
                    used.insert(session.clone());
                    sides.insert(side, session.clone());
                    inferred.push((session.clone(), side));
                }
            }
        }
    }

    // Last resort: first unused application-tagged sessions, discovery order.
    for side in [Side::Left, Side::Right] {
        if sides.contains_key(&side) {
            continue;
        }
        if let Some(session) = fallback.iter().find(|id| !used.contains(*id)) {
            used.insert(session.clone());
            sides.insert(side, session.clone());
            inferred.push((session.clone(), side));
        }
    }

    if sides.is_empty() {
        return None;
    }

    // Poll cadence and trace hints for the chosen children.
    let mut poll_intervals = HashMap::new();
    if let Some(agent_tile) = agent_tile {
        for rel in layout.metadata.agent_relationships.values() {
            if rel.source_id != agent_tile {
                continue;
            }
            let Some(session) = tile_session.get(rel.target_id.as_str()) else {
                continue;
            };
            if !used.contains(session) {
                continue;
            }
            if let Some(freq_ms) = rel.poll_frequency.filter(|ms| *ms > 0) {
                let interval = Duration::from_millis(freq_ms as u64).max(MIN_POLL_INTERVAL);
                poll_intervals.insert(session.clone(), interval);
            }
        }
    }
    let mut trace_ids = HashMap::new();
    for summary in summaries {
        if !used.contains(&summary.session_id) {
            continue;
        }
        if let Some(trace) = meta_str(&summary.metadata_object(), "trace_id") {
            trace_ids.insert(summary.session_id.clone(), trace);
        }
    }

    let mut sides: Vec<(Side, String)> = sides.into_iter().collect();
    sides.sort_by_key(|(side, _)| side.as_str());
    Some(TopologyPlan {
        agent_session_id,
        sides,
        inferred,
        poll_intervals,
        trace_ids,
    })
}

/// Network half of discovery: bounded retries around the pure resolution,
/// then lease acquisition, pairing creation, and metadata tagging.
pub struct Autopair {
    client: ManagerClient,
    settings: AutopairSettings,
    layout_cache: LayoutCache,
}

impl Autopair {
    pub fn new(client: ManagerClient, settings: AutopairSettings) -> Self {
        Self {
            client,
            settings,
            layout_cache: LayoutCache::new(),
        }
    }

    pub async fn run(&mut self, events: &UnboundedSender<AgentEvent>) -> Option<AutopairContext> {
        let attempts = self.settings.attempts.max(1);
        let mut plan: Option<TopologyPlan> = None;
        for attempt in 0..attempts {
            match self.snapshot(events).await {
                Some(found) => {
                    plan = Some(found);
                    break;
                }
                None => {
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.settings.interval).await;
                    }
                }
            }
        }
        let Some(plan) = plan else {
            let _ = events.send(AgentEvent::Warn(
                "autopair: no agent or paddle sessions discovered".into(),
            ));
            return None;
        };

        let lease = match self
            .client
            .acquire_controller_lease(
                &plan.agent_session_id,
                Some(self.settings.lease_ttl_ms),
                Some(&self.settings.lease_reason),
            )
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                let _ = events.send(AgentEvent::Error(format!(
                    "failed to acquire controller lease: {err}"
                )));
                return None;
            }
        };
        let _ = events.send(AgentEvent::Info(format!(
            "controller lease acquired (expires at {})",
            lease.expires_at_ms
        )));

        let mut poll_intervals = plan.poll_intervals.clone();
        for (side, child) in &plan.sides {
            match self
                .client
                .create_controller_pairing(
                    &plan.agent_session_id,
                    child,
                    self.settings.pair_template.as_deref(),
                    Some(self.settings.pair_cadence),
                )
                .await
            {
                Ok(pairing) => {
                    poll_intervals
                        .entry(child.clone())
                        .or_insert_with(|| cadence_interval(pairing.update_cadence));
                    let _ = events.send(AgentEvent::Info(format!(
                        "paired agent {} -> {side} session {child}",
                        plan.agent_session_id
                    )));
                }
                Err(err) => {
                    let _ = events.send(AgentEvent::Error(format!(
                        "failed to pair agent with {side} session {child}: {err}"
                    )));
                }
            }
        }

        for (child, side) in &plan.inferred {
            let mut metadata = HashMap::new();
            metadata.insert("pong_role".to_string(), side.as_str().to_string());
            if let Err(err) = self
                .client
                .update_session_metadata(child, &metadata, None)
                .await
            {
                let _ = events.send(AgentEvent::Warn(format!(
                    "failed to tag {side} role on session {child}: {err}"
                )));
            }
        }

        let mut session_roles: HashMap<String, SessionRole> = HashMap::new();
        session_roles.insert(plan.agent_session_id.clone(), SessionRole::Agent);
        let mut child_sessions = HashMap::new();
        for (side, child) in &plan.sides {
            session_roles.insert(child.clone(), SessionRole::Player(*side));
            child_sessions.insert(*side, child.clone());
        }
        info!(
            target = "agent.autopair",
            agent = %plan.agent_session_id,
            children = plan.sides.len(),
            "topology discovery complete"
        );

        Some(AutopairContext {
            controller_session_id: plan.agent_session_id,
            controller_token: lease.controller_token,
            lease_expires_at_ms: lease.expires_at_ms,
            child_sessions,
            session_roles,
            poll_intervals,
            trace_ids: plan.trace_ids,
        })
    }

    /// One discovery attempt: fetch summaries and layout, resolve. A layout
    /// fetch failure degrades to metadata-only resolution.
    async fn snapshot(&mut self, events: &UnboundedSender<AgentEvent>) -> Option<TopologyPlan> {
        let summaries = match self
            .client
            .list_sessions(&self.settings.private_beach_id)
            .await
        {
            Ok(summaries) => summaries,
            Err(err) => {
                let _ = events.send(AgentEvent::Error(format!(
                    "session discovery failed: {err}"
                )));
                return None;
            }
        };
        let layout = match self
            .layout_cache
            .fetch(&self.client, &self.settings.private_beach_id)
            .await
        {
            Ok(layout) => layout,
            Err(err) => {
                let _ = events.send(AgentEvent::Warn(format!(
                    "canvas layout unavailable, resolving from metadata only: {err}"
                )));
                CanvasLayout::default()
            }
        };
        resolve_topology(&summaries, &layout, self.settings.session_tag.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(session_id: &str, metadata: Value) -> SessionSummary {
        serde_json::from_value(serde_json::json!({
            "session_id": session_id,
            "metadata": metadata,
        }))
        .expect("summary")
    }

    fn layout(tiles: Value, relationships: Value) -> CanvasLayout {
        serde_json::from_value(serde_json::json!({
            "version": 3,
            "tiles": tiles,
            "metadata": {"agentRelationships": relationships},
        }))
        .expect("layout")
    }

    fn tile(id: &str, x: f64, meta: Value) -> Value {
        serde_json::json!({
            "id": id,
            "position": {"x": x, "y": 0.0},
            "metadata": meta,
        })
    }

    #[test]
    fn declared_metadata_roles_win() {
        let summaries = vec![
            summary("agent-1", serde_json::json!({"pong_role": "agent"})),
            summary("paddle-l", serde_json::json!({"pong_role": "lhs"})),
            summary("paddle-r", serde_json::json!({"pong_role": "rhs"})),
        ];
        let plan =
            resolve_topology(&summaries, &CanvasLayout::default(), None).expect("plan");
        assert_eq!(plan.agent_session_id, "agent-1");
        assert_eq!(
            plan.sides,
            vec![
                (Side::Left, "paddle-l".to_string()),
                (Side::Right, "paddle-r".to_string()),
            ]
        );
        assert!(plan.inferred.is_empty());
    }

    #[test]
    fn session_tag_selects_between_agents() {
        let summaries = vec![
            summary(
                "agent-a",
                serde_json::json!({"pong_role": "agent", "pong_tag": "blue"}),
            ),
            summary(
                "agent-b",
                serde_json::json!({"pong_role": "agent", "pong_tag": "green"}),
            ),
            summary("paddle-l", serde_json::json!({"pong_role": "lhs"})),
        ];
        let plan = resolve_topology(&summaries, &CanvasLayout::default(), Some("green"))
            .expect("plan");
        assert_eq!(plan.agent_session_id, "agent-b");

        // Without a tag the first declared agent wins.
        let plan = resolve_topology(&summaries, &CanvasLayout::default(), None).expect("plan");
        assert_eq!(plan.agent_session_id, "agent-a");
    }

    #[test]
    fn relationship_positions_resolve_sides_deterministically() {
        let tiles = serde_json::json!({
            "t-agent": tile("t-agent", 7.0, serde_json::json!({
                "nodeType": "agent", "sessionId": "agent-1",
            })),
            "t-a": tile("t-a", 5.0, serde_json::json!({"sessionId": "sess-a"})),
            "t-b": tile("t-b", 10.0, serde_json::json!({"sessionId": "sess-b"})),
        });
        let rels = serde_json::json!({
            "r1": {"id": "r1", "sourceId": "t-agent", "targetId": "t-a"},
            "r2": {"id": "r2", "sourceId": "t-agent", "targetId": "t-b", "pollFrequency": 100},
        });
        let summaries = vec![
            summary("agent-1", Value::Null),
            summary("sess-b", Value::Null),
            summary("sess-a", Value::Null),
        ];
        let layout = layout(tiles, rels);

        // Repeated runs over identical input give identical assignments.
        for _ in 0..8 {
            let plan = resolve_topology(&summaries, &layout, None).expect("plan");
            assert_eq!(plan.agent_session_id, "agent-1");
            assert_eq!(
                plan.sides,
                vec![
                    (Side::Left, "sess-a".to_string()),
                    (Side::Right, "sess-b".to_string()),
                ]
            );
            // Poll frequency floor is enforced.
            assert_eq!(
                plan.poll_intervals.get("sess-b").copied(),
                Some(MIN_POLL_INTERVAL)
            );
        }
    }

    #[test]
    fn application_tiles_fill_remaining_sides_in_discovery_order() {
        let tiles = serde_json::json!({
            "t-agent": tile("t-agent", 0.0, serde_json::json!({
                "nodeType": "agent", "sessionId": "agent-1",
            })),
            "t-a": tile("t-a", 4.0, serde_json::json!({
                "nodeType": "application", "sessionId": "app-1",
            })),
            "t-b": tile("t-b", 8.0, serde_json::json!({
                "nodeType": "application", "sessionId": "app-2",
            })),
        });
        let summaries = vec![
            summary("agent-1", Value::Null),
            summary("app-2", Value::Null),
            summary("app-1", Value::Null),
        ];
        let plan = resolve_topology(
            &summaries,
            &layout(tiles, serde_json::json!({})),
            None,
        )
        .expect("plan");
        // No relationships: discovery order decides, first summary first.
        assert_eq!(
            plan.sides,
            vec![
                (Side::Left, "app-2".to_string()),
                (Side::Right, "app-1".to_string()),
            ]
        );
        assert_eq!(plan.inferred.len(), 2);
    }

    #[test]
    fn no_agent_means_no_plan() {
        let summaries = vec![summary("paddle-l", serde_json::json!({"pong_role": "lhs"}))];
        assert!(resolve_topology(&summaries, &CanvasLayout::default(), None).is_none());
    }
}
