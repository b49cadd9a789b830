//! Transport through the central gateway: HTTP for history and sends, a
//! WebSocket for the live feed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hlchat_common::message::now_millis;
use hlchat_common::{Address, AuthPayload, Eip712Domain, Message, RoomId, SignatureScheme, TypedData};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::signer::WalletSigner;
use crate::transport::{
    is_self_echo, HistoryWindow, MessageCallback, OutgoingMessage, SignedForm, StatusCallback,
    SubscriptionHandle, Transport,
};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Gateway base URL, e.g. `http://localhost:3030`.
    pub base_url: String,
    /// Scheme used for the `/auth` handshake.
    pub scheme: SignatureScheme,
    pub domain: Eip712Domain,
    pub request_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl RelayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            scheme: SignatureScheme::Personal,
            domain: Eip712Domain::default(),
            request_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    address: String,
    signature: String,
    timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    typed_data: Option<&'a TypedData>,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest<'a> {
    signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    typed_data: Option<&'a TypedData>,
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    pair: &'a str,
    market: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

// ─── Transport ───────────────────────────────────────────────────────────────

pub struct RelayTransport {
    http: reqwest::Client,
    base: Url,
    config: RelayConfig,
    session: RwLock<Option<(Address, String)>>,
}

impl RelayTransport {
    pub fn new(config: RelayConfig) -> Result<Self, ChatError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ChatError::Network(format!("invalid gateway URL: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base,
            config,
            session: RwLock::new(None),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Network("gateway URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn live_url(&self, room: &RoomId) -> Result<Url, ChatError> {
        let mut url = self.endpoint(&["rooms", room.as_str(), "live"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::Network("cannot derive WebSocket URL".into()))?;
        Ok(url)
    }

    async fn session_token(&self, address: &Address) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|(owner, _)| owner == address)
            .map(|(_, token)| token.clone())
    }
}

/// Turn a non-success gateway response into a classified error.
async fn rejection(resp: reqwest::Response) -> ChatError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    ChatError::from_gateway(status, &error)
}

#[async_trait]
impl Transport for RelayTransport {
    /// Run the `/auth` handshake once per wallet and keep the session token.
    async fn authorize(&self, signer: &dyn WalletSigner) -> Result<(), ChatError> {
        let address = signer.address();
        if self.session_token(&address).await.is_some() {
            return Ok(());
        }

        let payload = AuthPayload {
            address,
            timestamp: now_millis(),
        };
        let typed = match self.config.scheme {
            SignatureScheme::Personal => None,
            SignatureScheme::Typed => Some(TypedData::auth(self.config.domain.clone(), payload.clone())),
        };
        let signature = match &typed {
            None => signer.sign_personal(&payload.to_plain()).await?,
            Some(typed) => signer.sign_typed(typed).await?,
        };

        let resp = self
            .http
            .post(self.endpoint(&["auth"])?)
            .json(&AuthRequest {
                address: address.to_string(),
                signature: signature.to_string(),
                timestamp: payload.timestamp,
                typed_data: typed.as_ref(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let body: AuthResponse = resp.json().await?;
        *self.session.write().await = Some((address, body.token));
        info!(%address, "relay session established");
        Ok(())
    }

    fn default_window(&self) -> HistoryWindow {
        HistoryWindow::Unbounded
    }

    async fn load_history(
        &self,
        room: &RoomId,
        window: HistoryWindow,
    ) -> Result<Vec<Message>, ChatError> {
        let mut url = self.endpoint(&["rooms", room.as_str(), "messages"])?;
        if let Some(since) = window.since(now_millis()) {
            url.query_pairs_mut().append_pair("since", &since.to_string());
        }
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let mut messages: Vec<Message> = resp
            .json()
            .await
            .map_err(|e| ChatError::Decode(e.to_string()))?;
        messages.retain(|m| &m.room == room);
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn subscribe(
        &self,
        room: &RoomId,
        local: Option<Address>,
        on_message: MessageCallback,
        on_status: StatusCallback,
    ) -> Result<SubscriptionHandle, ChatError> {
        let url = self.live_url(room)?;
        // First connection is made here so a dead gateway fails the subscribe.
        let socket = connect_live(&url, self.config.request_timeout).await?;
        on_status(true);

        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(read_live(
            LiveFeed {
                url,
                room: room.clone(),
                local,
                closed: closed.clone(),
                on_message,
                on_status,
                connect_timeout: self.config.request_timeout,
                backoff_initial: self.config.reconnect_initial,
                backoff_max: self.config.reconnect_max,
            },
            socket,
        ));
        Ok(SubscriptionHandle::new(room.clone(), closed, vec![task]))
    }

    async fn send(&self, outgoing: &OutgoingMessage) -> Result<Message, ChatError> {
        let message = &outgoing.message;
        let (plain, typed) = match &outgoing.signed {
            SignedForm::Plain(plain) => (Some(plain.as_str()), None),
            SignedForm::Typed(typed) => (None, Some(typed)),
        };
        let mut request = self.http.post(self.endpoint(&["message"])?).json(&MessageRequest {
            signature: message.signature.to_string(),
            message: plain,
            typed_data: typed,
            address: message.address.to_string(),
            name: message.display_name.as_deref(),
            pair: &outgoing.pair,
            market: &outgoing.market,
        });
        if let Some(token) = self.session_token(&message.address).await {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let error = rejection(resp).await;
            if matches!(error, ChatError::SessionRequired) {
                // Expired or unknown to a restarted gateway; the next authorize signs in again.
                let mut session = self.session.write().await;
                if session.as_ref().is_some_and(|(owner, _)| *owner == message.address) {
                    *session = None;
                }
            }
            return Err(error);
        }
        debug!(room = %message.room, nonce = %message.nonce, "relay accepted message");
        Ok(message.clone())
    }
}

type LiveSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct LiveFeed {
    url: Url,
    room: RoomId,
    local: Option<Address>,
    closed: Arc<AtomicBool>,
    on_message: MessageCallback,
    on_status: StatusCallback,
    connect_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl LiveFeed {
    fn deliver(&self, text: &str) {
        let message: Message = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(room = %self.room, error = %e, "dropping malformed live frame");
                return;
            }
        };
        if message.room != self.room || is_self_echo(self.local, &message) {
            return;
        }
        if !self.closed.load(Ordering::SeqCst) {
            (self.on_message)(message);
        }
    }
}

/// Open the live socket, giving up after `timeout`.
async fn connect_live(url: &Url, timeout: Duration) -> Result<LiveSocket, ChatError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ChatError::Network(format!("live connect to {url} timed out"))),
    }
}

/// Read frames until the socket drops, then reconnect with doubling backoff.
async fn read_live(feed: LiveFeed, socket: LiveSocket) {
    let mut socket = Some(socket);
    let mut backoff = feed.backoff_initial;

    while !feed.closed.load(Ordering::SeqCst) {
        let mut ws = match socket.take() {
            Some(ws) => ws,
            None => match connect_live(&feed.url, feed.connect_timeout).await {
                Ok(ws) => {
                    info!(room = %feed.room, "live feed reconnected");
                    (feed.on_status)(true);
                    backoff = feed.backoff_initial;
                    ws
                }
                Err(e) => {
                    debug!(room = %feed.room, error = %e, ?backoff, "live feed connect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(feed.backoff_max);
                    continue;
                }
            },
        };

        while let Some(frame) = ws.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => feed.deliver(text.as_str()),
                Ok(tungstenite::Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(room = %feed.room, error = %e, "live feed error");
                    break;
                }
            }
        }

        if feed.closed.load(Ordering::SeqCst) {
            break;
        }
        warn!(room = %feed.room, ?backoff, "live feed dropped, reconnecting");
        (feed.on_status)(false);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(feed.backoff_max);
    }
}
