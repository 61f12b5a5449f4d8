//! Wire types for the manager's session, controller, and canvas APIs.
//!
//! Deserialization is deliberately liberal: every field the agent does not
//! strictly need carries a default so schema drift on the manager side never
//! breaks event decoding.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One session as reported by `GET /private-beaches/{id}/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub private_beach_id: Option<String>,
    #[serde(default)]
    pub harness_type: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub location_hint: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub controller_token: Option<String>,
    #[serde(default)]
    pub controller_expires_at_ms: Option<i64>,
}

impl SessionSummary {
    /// Session metadata as a JSON object. The manager stores metadata as an
    /// arbitrary JSON value and some writers double-encode it as a string;
    /// both forms are accepted, anything else yields an empty map.
    pub fn metadata_object(&self) -> serde_json::Map<String, Value> {
        metadata_object(self.metadata.as_ref())
    }
}

pub fn metadata_object(value: Option<&Value>) -> serde_json::Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
        _ => serde_json::Map::new(),
    }
}

/// Controller lease granted by `POST /sessions/{id}/controller/lease`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerLease {
    pub controller_token: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerUpdateCadence {
    Fast,
    Balanced,
    Slow,
}

impl Default for ControllerUpdateCadence {
    fn default() -> Self {
        ControllerUpdateCadence::Balanced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingTransportKind {
    FastPath,
    HttpFallback,
    Pending,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairingTransportStatus {
    pub transport: PairingTransportKind,
    #[serde(default)]
    pub last_event_ms: Option<i64>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Controller-to-child pairing record.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerPairing {
    #[serde(default)]
    pub pairing_id: String,
    pub controller_session_id: String,
    pub child_session_id: String,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub update_cadence: ControllerUpdateCadence,
    #[serde(default)]
    pub transport_status: Option<PairingTransportStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPairingAction {
    Added,
    Updated,
    Removed,
}

/// One pairing change delivered on `GET /sessions/{id}/controllers/stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerPairingEvent {
    pub controller_session_id: String,
    pub child_session_id: String,
    pub action: ControllerPairingAction,
    #[serde(default)]
    pub pairing: Option<ControllerPairing>,
}

/// State update for a session, pushed on the state stream and returned by the
/// latest-state fetch. `payload` carries harness-specific content such as
/// `terminal_full` frames.
#[derive(Debug, Clone, Deserialize)]
pub struct StateDiff {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------- canvas

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasPoint {
    pub x: f64,
    pub y: f64,
}

/// Canvas tile; `metadata` carries `nodeType`, the bound `sessionId`, and
/// role hints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasTileNode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub position: CanvasPoint,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CanvasTileNode {
    pub fn metadata_object(&self) -> serde_json::Map<String, Value> {
        metadata_object(self.metadata.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasAgentRelationship {
    #[serde(default)]
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub update_mode: Option<String>,
    #[serde(default)]
    pub poll_frequency: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasMetadata {
    #[serde(default)]
    pub agent_relationships: HashMap<String, CanvasAgentRelationship>,
}

/// Canvas layout graph for a workspace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasLayout {
    #[serde(default)]
    pub version: u8,
    #[serde(default)]
    pub tiles: HashMap<String, CanvasTileNode>,
    #[serde(default)]
    pub metadata: CanvasMetadata,
}

// ---------------------------------------------------------------- actions

#[derive(Debug, Clone, Serialize)]
pub struct ActionMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Action envelope queued to `POST /sessions/{id}/actions`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionCommand {
    pub id: Uuid,
    pub action_type: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ActionMeta>,
}

impl ActionCommand {
    /// Wraps raw bytes destined for the remote terminal in a uniquely
    /// identified `terminal_write` envelope.
    pub fn terminal_write(bytes: impl Into<String>, trace_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: "terminal_write".into(),
            payload: serde_json::json!({ "bytes": bytes.into() }),
            meta: trace_id.map(|trace_id| ActionMeta {
                trace_id: Some(trace_id),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct QueueActionsRequest<'a> {
    pub controller_token: &'a str,
    pub actions: &'a [ActionCommand],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_accepts_object_and_string_forms() {
        let object = serde_json::json!({"pong_role": "lhs"});
        let map = metadata_object(Some(&object));
        assert_eq!(map.get("pong_role").and_then(Value::as_str), Some("lhs"));

        let encoded = Value::String("{\"pong_role\":\"agent\"}".into());
        let map = metadata_object(Some(&encoded));
        assert_eq!(map.get("pong_role").and_then(Value::as_str), Some("agent"));

        assert!(metadata_object(Some(&Value::String("not json".into()))).is_empty());
        assert!(metadata_object(None).is_empty());
    }

    #[test]
    fn terminal_write_envelope_shape() {
        let action = ActionCommand::terminal_write("m 1.50\n", Some("trace-7".into()));
        let value = serde_json::to_value(&action).expect("serialize action");
        assert_eq!(value["action_type"], "terminal_write");
        assert_eq!(value["payload"]["bytes"], "m 1.50\n");
        assert_eq!(value["meta"]["trace_id"], "trace-7");
        assert!(Uuid::parse_str(value["id"].as_str().expect("id")).is_ok());
    }

    #[test]
    fn pairing_event_decodes_with_minimal_fields() {
        let event: ControllerPairingEvent = serde_json::from_value(serde_json::json!({
            "controller_session_id": "agent-1",
            "child_session_id": "paddle-1",
            "action": "removed",
        }))
        .expect("decode pairing event");
        assert_eq!(event.action, ControllerPairingAction::Removed);
        assert!(event.pairing.is_none());
    }

    #[test]
    fn canvas_layout_decodes_camel_case_graph() {
        let layout: CanvasLayout = serde_json::from_value(serde_json::json!({
            "version": 3,
            "tiles": {
                "tile-a": {
                    "id": "tile-a",
                    "position": {"x": 5.0, "y": 10.0},
                    "metadata": {"nodeType": "application", "sessionId": "sess-a"},
                },
            },
            "metadata": {
                "agentRelationships": {
                    "rel-1": {
                        "id": "rel-1",
                        "sourceId": "tile-agent",
                        "targetId": "tile-a",
                        "pollFrequency": 500,
                    },
                },
            },
        }))
        .expect("decode layout");
        let tile = layout.tiles.get("tile-a").expect("tile");
        assert_eq!(tile.position.x, 5.0);
        assert_eq!(
            tile.metadata_object().get("sessionId").and_then(Value::as_str),
            Some("sess-a")
        );
        let rel = layout.metadata.agent_relationships.get("rel-1").expect("rel");
        assert_eq!(rel.poll_frequency, Some(500));
    }
}
