use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use hlchat_common::{Address, Message, RoomId, TypedData, WalletSignature};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::auth::{AuthError, Gateway, SignIn, SignedPayload, Submission};

// ─── API types ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub address: String,
    pub signature: String,
    pub timestamp: u64,
    #[serde(default)]
    pub typed_data: Option<TypedData>,
}

#[derive(Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

/// Body of `POST /message`. Exactly one of `message` (the personal_sign
/// string) and `typed_data` must be present.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub signature: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub typed_data: Option<TypedData>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub pair: String,
    pub market: String,
}

#[derive(Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn reject(err: AuthError) -> ApiError {
    (
        err.status(),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    reject(AuthError::InvalidPayload(msg.into()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn auth_handler(
    State(gateway): State<Arc<Gateway>>,
    body: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let address: Address = req
        .address
        .parse()
        .map_err(|_| bad_request("invalid address"))?;
    let signature: WalletSignature = req
        .signature
        .parse()
        .map_err(|_| bad_request("invalid signature encoding"))?;

    let token = gateway
        .sign_in(SignIn {
            address,
            signature,
            timestamp: req.timestamp,
            typed_data: req.typed_data,
        })
        .map_err(reject)?;
    Ok(Json(AuthResponse { token }))
}

async fn message_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;

    let payload = match (req.message, req.typed_data) {
        (Some(plain), None) => SignedPayload::Plain(plain),
        (None, Some(typed)) => SignedPayload::Typed(typed),
        (Some(_), Some(_)) => return Err(bad_request("send either message or typedData, not both")),
        (None, None) => return Err(bad_request("missing message or typedData")),
    };
    let signature: WalletSignature = req
        .signature
        .parse()
        .map_err(|_| reject(AuthError::SignatureMismatch))?;
    let claimed_address = req
        .address
        .as_deref()
        .map(str::parse::<Address>)
        .transpose()
        .map_err(|_| bad_request("invalid address"))?;
    if req.pair.trim().is_empty() || req.market.trim().is_empty() {
        return Err(bad_request("pair and market are required"));
    }

    let submission = Submission {
        payload,
        signature,
        claimed_address,
        room: RoomId::new(&req.pair, &req.market),
        name: req.name,
        session: bearer_token(&headers),
    };
    match gateway.authenticate_and_accept(submission).await {
        Ok(_) => Ok(Json(SuccessResponse { success: true })),
        Err(e) => {
            debug!(error = %e, "message rejected");
            Err(reject(e))
        }
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn history_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(room): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let messages = gateway
        .history(&RoomId::from_raw(room), query.since, query.limit)
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn live_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(room): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Subscribe before the handshake completes so nothing accepted after it is missed.
    let feed = gateway.subscribe();
    let room = RoomId::from_raw(room);
    upgrade.on_upgrade(move |socket| stream_room(socket, room, feed))
}

async fn stream_room(mut socket: WebSocket, room: RoomId, mut feed: broadcast::Receiver<Message>) {
    debug!(%room, "live subscriber connected");
    loop {
        tokio::select! {
            received = feed.recv() => match received {
                Ok(message) => {
                    if message.room != room {
                        continue;
                    }
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to encode live message");
                            continue;
                        }
                    };
                    if socket.send(ws::Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%room, skipped, "live subscriber lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(ws::Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(%room, "live subscriber disconnected");
}

/// The gateway's HTTP surface.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/auth", post(auth_handler))
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .route("/rooms/{room}/messages", get(history_handler))
        .route("/rooms/{room}/live", get(live_handler))
        .layer(cors)
        .with_state(gateway)
}
