//! Message authentication: signature recovery, freshness, replay and rate
//! checks, name ownership, then persistence and fan-out.

use std::sync::Arc;

use axum::http::StatusCode;
use hlchat_common::identity::eip191_hash;
use hlchat_common::message::{now_millis, truncate_content};
use hlchat_common::typed::TypedBody;
use hlchat_common::{
    Address, AuthPayload, Message, MessagePayload, RoomId, SignatureScheme, TypedData,
    WalletSignature,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::guard::{NonceGuard, RateGuard};
use crate::names::{NameOwnershipCache, NameRegistry};
use crate::session::SessionStore;
use crate::store::{MessageStore, StoreError};

/// Capacity of the fan-out channel; slow live subscribers skip ahead past this.
const BROADCAST_CAPACITY: usize = 1024;

/// Why a submission was refused.
///
/// Display strings carry stable phrases (`signature`, `timestamp`, `nonce`,
/// `rate limit`, `name`, `session`, `storage`) that clients classify on.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("signature does not match address")]
    SignatureMismatch,
    #[error("stale timestamp: outside the accepted window")]
    StaleTimestamp,
    #[error("nonce already used")]
    NonceReused,
    #[error("rate limit exceeded, slow down")]
    RateLimited,
    #[error("name '{0}' is not owned by this address")]
    NameNotOwned(String),
    #[error("name registry unavailable: {0}")]
    NameLookupFailed(String),
    #[error("valid session required")]
    SessionRequired,
    #[error("storage error: {0}")]
    StorageError(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::StorageError(_) | AuthError::NameLookupFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// What the wallet signed.
#[derive(Debug, Clone)]
pub enum SignedPayload {
    /// The exact string passed to `personal_sign`.
    Plain(String),
    Typed(TypedData),
}

/// A message submission as received from a client.
#[derive(Debug, Clone)]
pub struct Submission {
    pub payload: SignedPayload,
    pub signature: WalletSignature,
    pub claimed_address: Option<Address>,
    /// Room named by the request's pair and market.
    pub room: RoomId,
    pub name: Option<String>,
    pub session: Option<String>,
}

/// A sign-in request for a session token.
#[derive(Debug, Clone)]
pub struct SignIn {
    pub address: Address,
    pub signature: WalletSignature,
    pub timestamp: u64,
    pub typed_data: Option<TypedData>,
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct Gateway {
    config: GatewayConfig,
    nonces: NonceGuard,
    rates: RateGuard,
    names: NameOwnershipCache,
    sessions: SessionStore,
    store: Arc<dyn MessageStore>,
    fanout: broadcast::Sender<Message>,
    clock: Clock,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn MessageStore>,
        registry: Arc<dyn NameRegistry>,
    ) -> Self {
        let config = config.validated();
        let (fanout, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            nonces: NonceGuard::new(config.nonce_ttl),
            rates: RateGuard::new(config.rate_limit, config.rate_window),
            names: NameOwnershipCache::new(registry, config.name_ttl, config.registry_timeout),
            sessions: SessionStore::new(config.session_ttl),
            store,
            fanout,
            clock: Arc::new(now_millis),
            config,
        }
    }

    /// Replace the wall clock used for freshness checks.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Nonces currently held against replay.
    pub fn remembered_nonces(&self) -> usize {
        self.nonces.len()
    }

    /// Live feed of every accepted message.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.fanout.subscribe()
    }

    fn is_fresh(&self, timestamp: u64, window: std::time::Duration) -> bool {
        (self.clock)().abs_diff(timestamp) <= window.as_millis() as u64
    }

    /// Authenticate a submission and, if it passes, persist and broadcast it.
    ///
    /// Rejections before the nonce check leave no trace. A nonce is consumed
    /// only once signature and freshness hold, and the sender's rate counter
    /// moves from then on even if the name check later fails.
    pub async fn authenticate_and_accept(&self, submission: Submission) -> Result<Message, AuthError> {
        let (payload, prehash, scheme) = match &submission.payload {
            SignedPayload::Plain(plain) => {
                let payload = MessagePayload::from_plain(plain)
                    .map_err(|e| AuthError::InvalidPayload(format!("unparseable message: {e}")))?;
                (payload, eip191_hash(plain.as_bytes()), SignatureScheme::Personal)
            }
            SignedPayload::Typed(typed) => {
                if typed.domain != self.config.domain {
                    return Err(AuthError::InvalidPayload("unexpected typed-data domain".into()));
                }
                let TypedBody::Message(payload) = &typed.body else {
                    return Err(AuthError::InvalidPayload("typed data is not a Message".into()));
                };
                (payload.clone(), typed.signing_hash(), SignatureScheme::Typed)
            }
        };

        if payload.room != submission.room {
            return Err(AuthError::InvalidPayload(format!(
                "payload room {} does not match {}",
                payload.room, submission.room
            )));
        }
        if payload.content.trim().is_empty() {
            return Err(AuthError::InvalidPayload("empty message".into()));
        }
        if payload.nonce.is_empty() {
            return Err(AuthError::InvalidPayload("missing nonce".into()));
        }
        let display_name = match (&payload.name, &submission.name) {
            (Some(signed), Some(claimed)) if !signed.eq_ignore_ascii_case(claimed) => {
                return Err(AuthError::InvalidPayload(
                    "claimed name differs from the signed one".into(),
                ));
            }
            (Some(name), _) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
        .filter(|name| !name.trim().is_empty());

        let address = submission
            .signature
            .recover(&prehash)
            .map_err(|_| AuthError::SignatureMismatch)?;
        if submission.claimed_address.is_some_and(|claimed| claimed != address) {
            return Err(AuthError::SignatureMismatch);
        }

        if self.config.require_session {
            let session_address = submission
                .session
                .as_deref()
                .and_then(|token| self.sessions.validate(token));
            if session_address != Some(address) {
                return Err(AuthError::SessionRequired);
            }
        }

        if !self.is_fresh(payload.timestamp, self.config.message_window) {
            return Err(AuthError::StaleTimestamp);
        }

        if !self.nonces.try_record(&payload.nonce) {
            debug!(%address, nonce = %payload.nonce, "replayed nonce");
            return Err(AuthError::NonceReused);
        }

        if !self.rates.try_acquire(&address) {
            warn!(%address, "rate limited");
            return Err(AuthError::RateLimited);
        }

        if let Some(name) = &display_name {
            match self.names.owns_name(&address, name).await {
                Ok(true) => {}
                Ok(false) => return Err(AuthError::NameNotOwned(name.clone())),
                Err(e) => return Err(AuthError::NameLookupFailed(e.to_string())),
            }
        }

        let message = Message {
            room: payload.room,
            address,
            display_name,
            content: truncate_content(&payload.content),
            timestamp: payload.timestamp,
            nonce: payload.nonce,
            signature: submission.signature,
            scheme,
        };

        match tokio::time::timeout(self.config.storage_timeout, self.store.insert(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(StoreError::Duplicate)) => {
                debug!(%address, nonce = %message.nonce, "nonce already stored");
                return Err(AuthError::NonceReused);
            }
            Ok(Err(e)) => return Err(AuthError::StorageError(e.to_string())),
            Err(_) => return Err(AuthError::StorageError("insert timed out".into())),
        }

        // No receivers is fine: nobody is watching this gateway right now.
        let _ = self.fanout.send(message.clone());
        debug!(room = %message.room, %address, "message accepted");
        Ok(message)
    }

    /// Verify a sign-in signature and issue a session token.
    pub fn sign_in(&self, request: SignIn) -> Result<String, AuthError> {
        let payload = AuthPayload {
            address: request.address,
            timestamp: request.timestamp,
        };
        let prehash = match &request.typed_data {
            None => eip191_hash(payload.to_plain().as_bytes()),
            Some(typed) => {
                if typed.domain != self.config.domain {
                    return Err(AuthError::InvalidPayload("unexpected typed-data domain".into()));
                }
                match &typed.body {
                    TypedBody::Auth(signed) if *signed == payload => typed.signing_hash(),
                    TypedBody::Auth(_) => {
                        return Err(AuthError::InvalidPayload(
                            "typed data does not match address/timestamp".into(),
                        ))
                    }
                    TypedBody::Message(_) => {
                        return Err(AuthError::InvalidPayload("typed data is not an Auth".into()))
                    }
                }
            }
        };

        let recovered = request
            .signature
            .recover(&prehash)
            .map_err(|_| AuthError::SignatureMismatch)?;
        if recovered != request.address {
            return Err(AuthError::SignatureMismatch);
        }
        if !self.is_fresh(request.timestamp, self.config.auth_window) {
            return Err(AuthError::StaleTimestamp);
        }

        info!(address = %request.address, "session issued");
        Ok(self.sessions.issue(request.address))
    }

    /// Stored history of `room`, bounded by the configured limits.
    pub async fn history(
        &self,
        room: &RoomId,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, AuthError> {
        let limit = limit
            .unwrap_or(self.config.history_default_limit)
            .clamp(1, self.config.history_max_limit);
        tokio::time::timeout(self.config.storage_timeout, self.store.history(room, since, limit))
            .await
            .map_err(|_| AuthError::StorageError("history query timed out".into()))?
            .map_err(|e| AuthError::StorageError(e.to_string()))
    }

    /// One pass of TTL eviction over every in-memory map.
    pub fn sweep(&self) {
        let nonces = self.nonces.sweep();
        let windows = self.rates.sweep();
        let sessions = self.sessions.sweep();
        let names = self.names.sweep();
        debug!(nonces, windows, sessions, names, "sweep complete");
    }
}
