//! Asynchronous client for the manager's session, controller, and canvas
//! APIs.
//!
//! Consumed by automation agents and tests. Wraps the REST endpoints plus the
//! SSE state/pairing feeds behind typed methods, handling bearer auth and
//! per-session trace-id propagation.

mod stream;
mod types;

use std::collections::HashMap;

use reqwest::{Client, RequestBuilder, StatusCode};
use reqwest_eventsource::{CannotCloneRequestError, EventSource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use stream::{PairingStream, StateStream};
pub use types::{
    metadata_object, ActionCommand, ActionMeta, CanvasAgentRelationship, CanvasLayout,
    CanvasMetadata, CanvasPoint, CanvasTileNode, ControllerLease, ControllerPairing,
    ControllerPairingAction, ControllerPairingEvent, ControllerUpdateCadence,
    PairingTransportKind, PairingTransportStatus, SessionSummary, StateDiff,
};

use types::QueueActionsRequest;

pub const TRACE_HEADER: &str = "x-trace-id";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("event stream failed: {0}")]
    Stream(String),
    #[error("event stream could not be established: {0}")]
    Subscribe(#[from] CannotCloneRequestError),
}

impl ManagerError {
    /// HTTP status attached to the failure, when the server got far enough
    /// to produce one. Callers branch on this for 429/409 handling.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ManagerError::UnexpectedStatus { status, .. } => Some(*status),
            ManagerError::Http(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }
}

#[derive(Clone)]
pub struct ManagerClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let token = token.and_then(|t| {
            let trimmed = t.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });
        Self {
            http: Client::new(),
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn expect_success<T: DeserializeOwned>(
        res: reqwest::Response,
    ) -> Result<T, ManagerError> {
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ManagerError::UnexpectedStatus { status, body })
        }
    }

    async fn expect_accepted(res: reqwest::Response) -> Result<(), ManagerError> {
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ManagerError::UnexpectedStatus { status, body })
        }
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: String,
        body: &B,
    ) -> Result<T, ManagerError> {
        let res = self
            .authorize(self.http.post(format!("{}{}", self.base_url, path)))
            .json(body)
            .send()
            .await?;
        Self::expect_success(res).await
    }

    // -------------------------------------------------------------- sessions

    pub async fn list_sessions(
        &self,
        private_beach_id: &str,
    ) -> Result<Vec<SessionSummary>, ManagerError> {
        let res = self
            .authorize(self.http.get(format!(
                "{}/private-beaches/{private_beach_id}/sessions",
                self.base_url
            )))
            .send()
            .await?;
        Self::expect_success(res).await
    }

    pub async fn canvas_layout(
        &self,
        private_beach_id: &str,
    ) -> Result<CanvasLayout, ManagerError> {
        let res = self
            .authorize(self.http.get(format!(
                "{}/private-beaches/{private_beach_id}/layout",
                self.base_url
            )))
            .send()
            .await?;
        Self::expect_success(res).await
    }

    pub async fn update_session_metadata(
        &self,
        session_id: &str,
        metadata: &HashMap<String, String>,
        location_hint: Option<&str>,
    ) -> Result<(), ManagerError> {
        let mut body = serde_json::json!({ "metadata": metadata });
        if let Some(hint) = location_hint {
            body["location_hint"] = serde_json::json!(hint);
        }
        let res = self
            .authorize(
                self.http
                    .patch(format!("{}/sessions/{session_id}", self.base_url)),
            )
            .json(&body)
            .send()
            .await?;
        Self::expect_accepted(res).await
    }

    // ------------------------------------------------------------ controller

    pub async fn acquire_controller_lease(
        &self,
        controller_session_id: &str,
        ttl_ms: Option<u64>,
        reason: Option<&str>,
    ) -> Result<ControllerLease, ManagerError> {
        let mut body = serde_json::Map::new();
        if let Some(ttl) = ttl_ms {
            body.insert("ttl_ms".into(), serde_json::json!(ttl));
        }
        if let Some(reason) = reason {
            body.insert("reason".into(), serde_json::json!(reason));
        }
        self.post_json(
            format!("/sessions/{controller_session_id}/controller/lease"),
            &body,
        )
        .await
    }

    pub async fn release_controller_lease(
        &self,
        controller_session_id: &str,
    ) -> Result<(), ManagerError> {
        let res = self
            .authorize(self.http.delete(format!(
                "{}/sessions/{controller_session_id}/controller/lease",
                self.base_url
            )))
            .send()
            .await?;
        Self::expect_accepted(res).await
    }

    pub async fn create_controller_pairing(
        &self,
        controller_session_id: &str,
        child_session_id: &str,
        prompt_template: Option<&str>,
        update_cadence: Option<ControllerUpdateCadence>,
    ) -> Result<ControllerPairing, ManagerError> {
        let mut body = serde_json::Map::new();
        body.insert("child_session_id".into(), serde_json::json!(child_session_id));
        if let Some(template) = prompt_template {
            body.insert("prompt_template".into(), serde_json::json!(template));
        }
        if let Some(cadence) = update_cadence {
            body.insert("update_cadence".into(), serde_json::json!(cadence));
        }
        self.post_json(
            format!("/sessions/{controller_session_id}/controllers"),
            &body,
        )
        .await
    }

    pub async fn list_controller_pairings(
        &self,
        controller_session_id: &str,
    ) -> Result<Vec<ControllerPairing>, ManagerError> {
        let res = self
            .authorize(self.http.get(format!(
                "{}/sessions/{controller_session_id}/controllers",
                self.base_url
            )))
            .send()
            .await?;
        Self::expect_success(res).await
    }

    // --------------------------------------------------------------- actions

    /// Queues actions for a child session under the given controller token.
    /// Success means the manager accepted the whole batch.
    pub async fn queue_actions(
        &self,
        session_id: &str,
        controller_token: &str,
        actions: &[ActionCommand],
        trace_id: Option<&str>,
    ) -> Result<(), ManagerError> {
        let body = QueueActionsRequest {
            controller_token,
            actions,
        };
        let mut builder = self
            .authorize(
                self.http
                    .post(format!("{}/sessions/{session_id}/actions", self.base_url)),
            )
            .json(&body);
        if let Some(trace_id) = trace_id {
            builder = builder.header(TRACE_HEADER, trace_id);
        }
        Self::expect_accepted(builder.send().await?).await
    }

    // ----------------------------------------------------------------- state

    /// Latest state diff for a session, if the manager holds one.
    pub async fn latest_state(
        &self,
        session_id: &str,
    ) -> Result<Option<StateDiff>, ManagerError> {
        let res = self
            .authorize(self.http.get(format!(
                "{}/sessions/{session_id}/state",
                self.base_url
            )))
            .send()
            .await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::expect_success(res).await
    }

    pub fn state_stream(&self, session_id: &str) -> Result<StateStream, ManagerError> {
        let builder = self.authorize(self.http.get(format!(
            "{}/sessions/{session_id}/state/stream",
            self.base_url
        )));
        let source = EventSource::new(builder)?;
        Ok(StateStream::new(stream::SseFeed::new(
            source,
            "state",
            format!("state:{session_id}"),
        )))
    }

    pub fn pairing_stream(
        &self,
        controller_session_id: &str,
    ) -> Result<PairingStream, ManagerError> {
        let builder = self.authorize(self.http.get(format!(
            "{}/sessions/{controller_session_id}/controllers/stream",
            self.base_url
        )));
        let source = EventSource::new(builder)?;
        Ok(PairingStream::new(stream::SseFeed::new(
            source,
            "controller_pairing",
            format!("pairings:{controller_session_id}"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn lists_sessions_with_metadata() {
        let app = Router::new().route(
            "/private-beaches/:id/sessions",
            get(|Path(id): Path<String>| async move {
                assert_eq!(id, "beach-1");
                Json(serde_json::json!([
                    {"session_id": "sess-a", "metadata": {"pong_role": "lhs"}},
                    {"session_id": "sess-b"},
                ]))
            }),
        );
        let base = serve(app).await;

        let client = ManagerClient::new(base, Some("token".into()));
        let sessions = client.list_sessions("beach-1").await.expect("list");
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions[0]
                .metadata_object()
                .get("pong_role")
                .and_then(serde_json::Value::as_str),
            Some("lhs")
        );
        assert!(sessions[1].metadata_object().is_empty());
    }

    #[tokio::test]
    async fn queue_actions_surfaces_rate_limit_status() {
        let app = Router::new().route(
            "/sessions/:id/actions",
            post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "throttled") }),
        );
        let base = serve(app).await;

        let client = ManagerClient::new(base, None);
        let action = ActionCommand::terminal_write("m 1.0\n", None);
        let err = client
            .queue_actions("sess-a", "ctl-token", std::slice::from_ref(&action), None)
            .await
            .expect_err("throttled");
        assert!(err.is_rate_limited());
        assert!(!err.is_conflict());
    }

    #[tokio::test]
    async fn latest_state_handles_no_content() {
        let app = Router::new().route(
            "/sessions/:id/state",
            get(|| async { AxumStatus::NO_CONTENT }),
        );
        let base = serve(app).await;

        let client = ManagerClient::new(base, None);
        let state = client.latest_state("sess-a").await.expect("fetch");
        assert!(state.is_none());
    }
}
