//! Loopback HTTP server: the agent WebSocket plus a small clearance API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::BridgeError;
use super::protocol::{AgentFrame, EventReply, InboundEvent};
use super::tabs::BridgeTabs;
use crate::clearance::{ClearanceCache, ClearanceEntry, ClearanceError, ClearanceStats, EgressPath};
use crate::coordinator::{CoordinatorHandle, RecoverySnapshot, SendError};
use crate::peer::TokenSubmission;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state of the bridge routes.
#[derive(Clone)]
pub struct BridgeState {
    pub tabs: BridgeTabs,
    pub coordinator: CoordinatorHandle,
    pub clearance: Option<Arc<ClearanceCache>>,
    /// Target used by clearance requests that do not name one.
    pub default_target: Url,
    pub cancel_token: CancellationToken,
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/bridge", get(bridge_ws))
        .route("/state", get(get_state))
        .route("/clearance", get(get_clearance))
        .route("/clearance/refresh", post(refresh_clearance))
        .route("/clearance/sweep", post(sweep_clearance))
        .route("/clearance/stats", get(clearance_stats))
        .with_state(state)
}

/// Bind `addr` (loopback only) and serve until the state's token is cancelled.
pub async fn serve(addr: SocketAddr, state: BridgeState) -> Result<(), BridgeError> {
    if !addr.ip().is_loopback() {
        return Err(BridgeError::NotLoopback(addr));
    }
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| BridgeError::Bind { addr, source })?;
    serve_on(listener, state).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: TcpListener, state: BridgeState) -> Result<(), BridgeError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Bridge listening on http://{}", addr);
    }
    let cancel_token = state.cancel_token.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!("Bridge shutting down...");
        })
        .await
        .map_err(BridgeError::Serve)
}

// ---------------------------------------------------------------------------
// Agent WebSocket
// ---------------------------------------------------------------------------

async fn bridge_ws(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = state.tabs.attach();
    let generation = session.generation;
    info!(generation, "Browser agent connected");

    let (reply_tx, mut reply_rx) = mpsc::channel::<EventReply>(16);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.cancel_token.cancelled() => break,

            frame = session.commands.recv() => {
                // `None`: a newer agent took over.
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode bridge command"),
                }
            }

            reply = reply_rx.recv() => {
                let Some(reply) = reply else { continue };
                match serde_json::to_string(&reply) {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode event reply"),
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_text(&state, text.as_str(), &reply_tx);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "Bridge socket error");
                        break;
                    }
                }
            }
        }
    }

    state.tabs.detach(generation);
    info!(generation, "Browser agent disconnected");
}

fn handle_agent_text(state: &BridgeState, text: &str, replies: &mpsc::Sender<EventReply>) {
    let frame = match serde_json::from_str::<AgentFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed bridge frame");
            return;
        }
    };

    match frame {
        AgentFrame::Reply {
            id,
            ok,
            result,
            error,
        } => state.tabs.resolve(id, ok, result, error),
        AgentFrame::Event { id, event } => {
            // Handled off the socket loop: answering may itself need the agent.
            let coordinator = state.coordinator.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let kind = event.kind();
                match dispatch_event(&coordinator, event).await {
                    Ok(Some(result)) => {
                        if let Some(reply_to) = id {
                            let _ = replies.send(EventReply { reply_to, result }).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(event = kind, error = %e, "Failed to deliver event"),
                }
            });
        }
    }
}

/// Forward one inbound event to the coordinator.
///
/// Returns the reply payload for events that produce one.
pub async fn dispatch_event(
    coordinator: &CoordinatorHandle,
    event: InboundEvent,
) -> Result<Option<Value>, SendError> {
    match event {
        InboundEvent::SendToken { token, pawtect, fp } => {
            coordinator
                .token_captured(TokenSubmission {
                    t: token,
                    pawtect,
                    fp,
                })
                .await?;
            Ok(None)
        }
        InboundEvent::SendCookie => {
            let reply = coordinator.send_cookie().await?;
            Ok(Some(serde_json::to_value(reply).unwrap_or(Value::Null)))
        }
        InboundEvent::SettingsUpdated { settings } => {
            coordinator.settings_updated(settings).await?;
            Ok(Some(serde_json::json!({ "ok": true })))
        }
        InboundEvent::QuickLogout => {
            let reply = coordinator.quick_logout().await?;
            Ok(Some(serde_json::to_value(reply).unwrap_or(Value::Null)))
        }
        InboundEvent::ComputeSignature { tab_id, body } => {
            coordinator.compute_signature(tab_id, body).await?;
            Ok(None)
        }
        InboundEvent::TabUpdated {
            tab_id,
            url,
            status,
        } => {
            coordinator.tab_updated(tab_id, url, status).await?;
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP routes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiErrorResponse {
    code: &'static str,
    message: String,
}

/// Error returned by the HTTP routes.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ClearanceError> for ApiError {
    fn from(err: ClearanceError) -> Self {
        match err {
            ClearanceError::InvalidProxy(_) | ClearanceError::InvalidTarget(_) => {
                ApiError::bad_request(err.to_string())
            }
            ClearanceError::Acquisition(_) | ClearanceError::Shared(_) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "ACQUISITION_FAILED", err.to_string())
            }
            ClearanceError::Cancelled => ApiError::service_unavailable(err.to_string()),
            ClearanceError::Persist(e) => {
                error!("Clearance persistence error: {}", e);
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to persist clearance cache",
                )
            }
        }
    }
}

impl From<SendError> for ApiError {
    fn from(err: SendError) -> Self {
        ApiError::service_unavailable(err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Parameters naming a clearance: egress proxy, identity and target.
#[derive(Debug, Default, Deserialize)]
pub struct ClearanceParams {
    pub proxy: Option<String>,
    pub user: Option<String>,
    pub target: Option<String>,
}

struct ResolvedParams {
    egress: Option<EgressPath>,
    identity: Option<String>,
    target: Url,
}

impl ClearanceParams {
    fn resolve(self, default_target: &Url) -> Result<ResolvedParams, ClearanceError> {
        let egress = self
            .proxy
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(EgressPath::parse)
            .transpose()?;
        let target = match self.target.as_deref() {
            Some(t) if !t.trim().is_empty() => {
                Url::parse(t).map_err(|e| ClearanceError::InvalidTarget(e.to_string()))?
            }
            _ => default_target.clone(),
        };
        Ok(ResolvedParams {
            egress,
            identity: self.user,
            target,
        })
    }
}

fn clearance_cache(state: &BridgeState) -> ApiResult<&Arc<ClearanceCache>> {
    state
        .clearance
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Clearance cache not enabled"))
}

async fn get_state(State(state): State<BridgeState>) -> ApiResult<Json<RecoverySnapshot>> {
    Ok(Json(state.coordinator.get_state().await?))
}

async fn get_clearance(
    State(state): State<BridgeState>,
    Query(params): Query<ClearanceParams>,
) -> ApiResult<Json<ClearanceEntry>> {
    let cache = clearance_cache(&state)?;
    let params = params.resolve(&state.default_target)?;
    let entry = cache
        .get_or_acquire(
            params.egress.as_ref(),
            params.identity.as_deref(),
            &params.target,
        )
        .await?;
    Ok(Json(entry))
}

async fn refresh_clearance(
    State(state): State<BridgeState>,
    Json(params): Json<ClearanceParams>,
) -> ApiResult<Json<ClearanceEntry>> {
    let cache = clearance_cache(&state)?;
    let params = params.resolve(&state.default_target)?;
    let entry = cache
        .force_refresh(
            params.egress.as_ref(),
            params.identity.as_deref(),
            &params.target,
        )
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub removed: usize,
}

async fn sweep_clearance(State(state): State<BridgeState>) -> ApiResult<Json<SweepResponse>> {
    let removed = clearance_cache(&state)?.sweep_expired().await?;
    Ok(Json(SweepResponse { removed }))
}

async fn clearance_stats(State(state): State<BridgeState>) -> ApiResult<Json<ClearanceStats>> {
    Ok(Json(clearance_cache(&state)?.stats()))
}
