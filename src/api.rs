//! HTTP API for Beacon.
//!
//! Identity arrives as trusted headers (`x-user-id`, `x-user-name`,
//! `x-campus-id`, `x-user-role`) set by the authentication gateway in front
//! of this service; the extractors here only enforce presence and role.
//! Submission is fail-closed: no reporter identity, no alert.
//!
//! The live channel at `GET /ws` upgrades to WebSocket, waits for a join
//! frame, registers the session with the fan-out registry, and then forwards
//! alert events until the operator disconnects. Missed events are not
//! replayed; `GET /alerts` is the catch-up path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::abuse::caller_key;
use crate::error::AlertError;
use crate::fanout::{NotificationFanout, OperatorGroup};
use crate::lifecycle::AlertService;
use crate::model::{
    AlertListResponse, AlertSummaryResponse, EmergencyAlert, ListQuery, ReporterIdentity,
    SubmitRequest, TransitionRequest,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AlertService>,
    pub fanout: NotificationFanout,
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alerts", post(submit_alert).get(list_alerts))
        .route("/alerts/summary", get(alert_summary))
        .route("/alerts/:id", get(get_alert).patch(transition_alert))
        .route("/ws", get(ws_operators))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Identity extractors (external auth gate contract)
// ============================================================================

/// Authenticated reporter, extracted from gateway headers.
pub struct Reporter(pub ReporterIdentity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Reporter
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let Some(user_id) = header_value(headers, "x-user-id") else {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthenticated" })),
            ));
        };
        Ok(Reporter(ReporterIdentity {
            user_id,
            display_name: header_value(headers, "x-user-name")
                .unwrap_or_else(|| "unknown".to_string()),
            campus_id: header_value(headers, "x-campus-id"),
            role: header_value(headers, "x-user-role").unwrap_or_else(|| "student".to_string()),
        }))
    }
}

/// Role held by a connected operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorRole {
    Admin,
    Police,
}

impl OperatorRole {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(OperatorRole::Admin),
            "police" => Some(OperatorRole::Police),
            _ => None,
        }
    }

    /// Groups this role is allowed to join on the live channel.
    pub fn permitted_groups(self) -> Vec<OperatorGroup> {
        match self {
            OperatorRole::Admin => vec![OperatorGroup::Admins],
            OperatorRole::Police => vec![OperatorGroup::Police],
        }
    }
}

/// Authenticated operator (admin or police), extracted from gateway headers.
pub struct Operator {
    pub operator_id: String,
    pub role: OperatorRole,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Operator
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let Some(operator_id) = header_value(headers, "x-user-id") else {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthenticated" })),
            ));
        };
        let role = header_value(headers, "x-user-role")
            .as_deref()
            .and_then(OperatorRole::parse);
        let Some(role) = role else {
            return Err((
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "operator_role_required" })),
            ));
        };
        Ok(Operator { operator_id, role })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

// ============================================================================
// Alert handlers
// ============================================================================

/// POST /alerts - Submit a new emergency alert.
///
/// Requires reporter identity headers; gated by the abuse guard using the
/// fingerprint header (network fallback). Returns `201 Created` with
/// `{alert_id, timestamp}`, `400` on validation failure, `429` with a
/// `Retry-After` header on rate limiting.
#[instrument(skip_all)]
pub async fn submit_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    reporter: Reporter,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AlertError> {
    let key = caller_key(&headers);
    let receipt = state.service.submit(request, reporter.0, &key).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /alerts - List alerts newest-first.
///
/// # Query Parameters
///
/// - `status` (optional): filter by lifecycle status
/// - `limit` (optional): cap on result count (default: 50)
#[instrument(skip(state))]
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<AlertListResponse>, AlertError> {
    let alerts = state.service.list(&query).await?;
    debug!(count = alerts.len(), "Alerts listed");
    Ok(Json(AlertListResponse {
        count: alerts.len(),
        alerts,
    }))
}

/// GET /alerts/summary - Per-status alert counts for the dashboard.
#[instrument(skip(state))]
pub async fn alert_summary(
    State(state): State<AppState>,
) -> Result<Json<AlertSummaryResponse>, AlertError> {
    let counts = state.service.status_counts().await?;
    Ok(Json(AlertSummaryResponse {
        timestamp: Utc::now(),
        counts,
    }))
}

/// GET /alerts/:id - Fetch one alert.
#[instrument(skip(state))]
pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EmergencyAlert>, AlertError> {
    let alert = state.service.get(id).await?;
    Ok(Json(alert))
}

/// PATCH /alerts/:id - Operator transition: status, acknowledgement, notes.
#[instrument(skip(state, operator, change), fields(operator_id = %operator.operator_id))]
pub async fn transition_alert(
    State(state): State<AppState>,
    operator: Operator,
    Path(id): Path<Uuid>,
    Json(change): Json<TransitionRequest>,
) -> Result<Json<EmergencyAlert>, AlertError> {
    let alert = state
        .service
        .transition(id, change, &operator.operator_id)
        .await?;
    Ok(Json(alert))
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Operator live channel
// ============================================================================

/// First frame an operator sends after the upgrade.
#[derive(Debug, Deserialize)]
struct JoinFrame {
    #[serde(rename = "type")]
    kind: String,
    /// Requested groups; defaults to everything the role permits.
    #[serde(default)]
    groups: Option<Vec<OperatorGroup>>,
}

/// GET /ws - Operator live event channel.
///
/// The client sends `{"type":"join"}` (optionally with `"groups"`), receives
/// a `joined` acknowledgement, and from then on receives `new_alert` and
/// `status_update` events as they are broadcast.
pub async fn ws_operators(
    State(state): State<AppState>,
    operator: Operator,
    ws: WebSocketUpgrade,
) -> Response {
    let fanout = state.fanout.clone();
    ws.on_upgrade(move |socket| operator_session(socket, fanout, operator))
}

async fn operator_session(socket: WebSocket, fanout: NotificationFanout, operator: Operator) {
    let (mut sink, mut stream) = socket.split();

    // Join phase: the session is not in any group until it presents a join
    // frame compatible with its role.
    let permitted = operator.role.permitted_groups();
    let groups = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<JoinFrame>(&text) {
                Ok(frame) if frame.kind == "join" => {
                    let requested = frame.groups.unwrap_or_else(|| permitted.clone());
                    let joined: Vec<OperatorGroup> = requested
                        .into_iter()
                        .filter(|g| permitted.contains(g))
                        .collect();
                    if joined.is_empty() {
                        let _ = sink
                            .send(Message::Text(
                                json!({ "type": "error", "message": "no permitted groups" })
                                    .to_string(),
                            ))
                            .await;
                        return;
                    }
                    break joined;
                }
                _ => {
                    let _ = sink
                        .send(Message::Text(
                            json!({ "type": "error", "message": "expected join frame" })
                                .to_string(),
                        ))
                        .await;
                }
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let (session_id, mut rx) = fanout.register(&groups);
    info!(
        %session_id,
        operator_id = %operator.operator_id,
        ?groups,
        "Operator session joined"
    );

    let ack = json!({ "type": "joined", "session_id": session_id, "groups": groups });
    if sink.send(Message::Text(ack.to_string())).await.is_err() {
        fanout.deregister(session_id);
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(payload) => {
                        if sink.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%session_id, error = %e, "Failed to encode alert event"),
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; other frames are ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    fanout.deregister(session_id);
    debug!(%session_id, "Operator session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn parts_with_headers(pairs: &[(&str, &str)]) -> Parts {
        let mut request = axum::http::Request::builder();
        for (name, value) in pairs {
            request = request.header(*name, *value);
        }
        let (parts, ()) = request.body(()).unwrap().into_parts();
        parts
    }

    #[tokio::test]
    async fn test_reporter_extractor_requires_user_id() {
        let mut parts = parts_with_headers(&[]);
        let result = Reporter::from_request_parts(&mut parts, &()).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reporter_extractor_snapshots_identity() {
        let mut parts = parts_with_headers(&[
            ("x-user-id", "u-7"),
            ("x-user-name", "Sam Chen"),
            ("x-campus-id", "C789"),
            ("x-user-role", "student"),
        ]);
        let Reporter(identity) = Reporter::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(identity.user_id, "u-7");
        assert_eq!(identity.display_name, "Sam Chen");
        assert_eq!(identity.campus_id.as_deref(), Some("C789"));
        assert_eq!(identity.role, "student");
    }

    #[tokio::test]
    async fn test_operator_extractor_rejects_non_operator_roles() {
        let mut parts = parts_with_headers(&[("x-user-id", "u-1"), ("x-user-role", "student")]);
        let result = Operator::from_request_parts(&mut parts, &()).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_operator_extractor_accepts_admin_and_police() {
        for (role, expected) in [("admin", OperatorRole::Admin), ("police", OperatorRole::Police)] {
            let mut parts = parts_with_headers(&[("x-user-id", "op-1"), ("x-user-role", role)]);
            let operator = Operator::from_request_parts(&mut parts, &()).await.unwrap();
            assert_eq!(operator.role, expected);
        }
    }

    #[test]
    fn test_role_group_mapping() {
        assert_eq!(
            OperatorRole::Admin.permitted_groups(),
            vec![OperatorGroup::Admins]
        );
        assert_eq!(
            OperatorRole::Police.permitted_groups(),
            vec![OperatorGroup::Police]
        );
    }

    #[test]
    fn test_join_frame_parsing() {
        let frame: JoinFrame = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert_eq!(frame.kind, "join");
        assert!(frame.groups.is_none());

        let frame: JoinFrame =
            serde_json::from_str(r#"{"type":"join","groups":["admins"]}"#).unwrap();
        assert_eq!(frame.groups.unwrap(), vec![OperatorGroup::Admins]);

        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u"));
        // sanity: unrelated header map helper
        assert_eq!(header_value(&headers, "x-user-id").as_deref(), Some("u"));
    }
}
