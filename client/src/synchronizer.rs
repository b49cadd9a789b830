//! Keeps one room's message list in step with a [`Transport`].
//!
//! Each room activation gets a generation number. Every load, subscription
//! callback and send records the generation it started under and does
//! nothing if the synchronizer has moved on by the time it completes, so a
//! slow load for an old room can never touch the new room's list. The live
//! subscription sits behind an async mutex that is held while one is torn
//! down or created, which keeps at most one of them alive.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hlchat_common::{Address, Eip712Domain, Message, RoomId, SignatureScheme};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::signer::WalletSigner;
use crate::transport::{MessageCallback, OutgoingMessage, StatusCallback, SubscriptionHandle, Transport};

/// Where the current room stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomStatus {
    Idle,
    /// Fetching history; `attempt` counts from 1.
    LoadingHistory { attempt: u32 },
    Subscribed,
    /// History could not be loaded. Distinct from an empty room.
    Failed { reason: String },
}

/// One displayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Sent from here, not yet acknowledged by the transport.
    Pending(Message),
    Confirmed(Message),
}

impl Entry {
    pub fn message(&self) -> &Message {
        match self {
            Entry::Pending(m) | Entry::Confirmed(m) => m,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Entry::Pending(_))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
    pub room_poll_interval: Duration,
    pub scheme: SignatureScheme,
    pub domain: Eip712Domain,
    /// Signed into every outgoing message when set.
    pub display_name: Option<String>,
    /// The local wallet; the transport suppresses its echoes.
    pub local_address: Option<Address>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1000),
            room_poll_interval: Duration::from_secs(1),
            scheme: SignatureScheme::Personal,
            domain: Eip712Domain::default(),
            display_name: None,
            local_address: None,
        }
    }
}

/// Receives what the synchronizer observes. All methods default to no-ops.
pub trait SyncListener: Send + Sync {
    fn on_message(&self, _message: &Message) {}
    fn on_history_loaded(&self, _messages: &[Message]) {}
    fn on_connection_status_change(&self, _connected: bool) {}
    fn on_error(&self, _error: &ChatError) {}
    fn on_status(&self, _status: &RoomStatus) {}
}

pub struct NoopListener;

impl SyncListener for NoopListener {}

/// Supplies the `(pair, market)` the user is currently looking at.
#[async_trait]
pub trait RoomSource: Send + Sync {
    async fn current_room(&self) -> Option<(String, String)>;
}

#[derive(Debug, Clone)]
struct ActiveRoom {
    pair: String,
    market: String,
    id: RoomId,
}

struct State {
    room: Option<ActiveRoom>,
    generation: u64,
    status: RoomStatus,
    entries: Vec<Entry>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    listener: Arc<dyn SyncListener>,
    config: SyncConfig,
    state: Mutex<State>,
    subscription: tokio::sync::Mutex<Option<SubscriptionHandle>>,
}

enum LoadOutcome {
    Loaded(Vec<Message>),
    Superseded,
    Failed(ChatError),
}

#[derive(Clone)]
pub struct RoomSynchronizer {
    inner: Arc<Inner>,
}

impl RoomSynchronizer {
    pub fn new(
        transport: Arc<dyn Transport>,
        listener: Arc<dyn SyncListener>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                listener,
                config,
                state: Mutex::new(State {
                    room: None,
                    generation: 0,
                    status: RoomStatus::Idle,
                    entries: Vec::new(),
                }),
                subscription: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> RoomStatus {
        self.inner.state().status.clone()
    }

    pub fn current_room(&self) -> Option<RoomId> {
        self.inner.state().room.as_ref().map(|r| r.id.clone())
    }

    /// Snapshot of the displayed list.
    pub fn messages(&self) -> Vec<Entry> {
        self.inner.state().entries.clone()
    }

    /// Switch to `{pair}_{market}`. A no-op if that room is already active.
    ///
    /// Returns once the room is subscribed, has failed, or has been
    /// superseded by a later switch.
    pub async fn set_room(&self, pair: &str, market: &str) -> Result<(), ChatError> {
        let Some((generation, id)) = self.inner.begin_switch(pair, market) else {
            return Ok(());
        };
        self.inner.teardown_current().await;
        self.inner.activate(generation, id).await
    }

    /// Try the current room again after it has failed.
    pub async fn retry(&self) -> Result<(), ChatError> {
        let (generation, id) = {
            let mut state = self.inner.state();
            let Some(room) = state.room.clone() else {
                return Err(ChatError::NoRoom);
            };
            if !matches!(state.status, RoomStatus::Failed { .. }) {
                return Ok(());
            }
            state.generation += 1;
            (state.generation, room.id)
        };
        self.inner.activate(generation, id).await
    }

    /// Sign and send `content` to the current room.
    ///
    /// The message shows up immediately as [`Entry::Pending`]; it becomes
    /// confirmed when the transport accepts it and is removed if it does not.
    /// Failed sends are never retried automatically.
    pub async fn send_message(
        &self,
        content: &str,
        signer: &dyn WalletSigner,
    ) -> Result<Message, ChatError> {
        let (room, generation) = {
            let state = self.inner.state();
            let room = state.room.clone().ok_or(ChatError::NoRoom)?;
            (room, state.generation)
        };
        let inner = &self.inner;

        let outgoing = async {
            inner.transport.authorize(signer).await?;
            OutgoingMessage::sign(
                signer,
                &room.pair,
                &room.market,
                content,
                inner.config.display_name.clone(),
                inner.config.scheme,
                &inner.config.domain,
            )
            .await
        }
        .await
        .inspect_err(|e| inner.listener.on_error(e))?;

        let nonce = outgoing.message.nonce.clone();
        inner.with_current(generation, |state| {
            state.entries.push(Entry::Pending(outgoing.message.clone()));
        });

        let mut sent = inner.transport.send(&outgoing).await;
        if matches!(sent, Err(ChatError::SessionRequired)) {
            // Rejected before the nonce is consumed, so the same signed message can go again.
            debug!(room = %room.id, "session rejected, signing in again");
            sent = match inner.transport.authorize(signer).await {
                Ok(()) => inner.transport.send(&outgoing).await,
                Err(e) => Err(e),
            };
        }

        match sent {
            Ok(message) => {
                inner.with_current(generation, |state| {
                    if let Some(entry) = state
                        .entries
                        .iter_mut()
                        .find(|e| e.is_pending() && e.message().nonce == nonce)
                    {
                        *entry = Entry::Confirmed(message.clone());
                    }
                });
                Ok(message)
            }
            Err(e) => {
                warn!(room = %room.id, error = %e, "send failed, rolling back");
                inner.with_current(generation, |state| {
                    state
                        .entries
                        .retain(|entry| !(entry.is_pending() && entry.message().nonce == nonce));
                });
                inner.listener.on_error(&e);
                Err(e)
            }
        }
    }

    /// Follow `source`, switching rooms whenever it reports a new one.
    ///
    /// The switch itself happens on the tick that sees the change; loading and
    /// subscribing run in their own task, so a slow room never holds the
    /// watcher back from the next change.
    pub fn spawn_room_watcher(&self, source: Arc<dyn RoomSource>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = inner.config.room_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some((pair, market)) = source.current_room().await else {
                    continue;
                };
                let Some((generation, id)) = inner.begin_switch(&pair, &market) else {
                    continue;
                };
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.teardown_current().await;
                    if let Err(e) = inner.activate(generation, id.clone()).await {
                        warn!(room = %id, error = %e, "room switch failed");
                    }
                });
            }
        })
    }

    /// Tear down the live subscription, if any.
    pub async fn shutdown(&self) {
        self.inner.teardown_current().await;
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `{pair}_{market}` the current room and start a new generation.
    /// `None` if that room is already current.
    fn begin_switch(&self, pair: &str, market: &str) -> Option<(u64, RoomId)> {
        let id = RoomId::new(pair, market);
        let mut state = self.state();
        if state.room.as_ref().is_some_and(|r| r.id == id) {
            return None;
        }
        state.generation += 1;
        state.room = Some(ActiveRoom {
            pair: pair.to_string(),
            market: market.to_string(),
            id: id.clone(),
        });
        state.entries.clear();
        info!(room = %id, "switching room");
        Some((state.generation, id))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    /// Run `f` on the state if `generation` is still the active one.
    fn with_current<T>(&self, generation: u64, f: impl FnOnce(&mut State) -> T) -> Option<T> {
        let mut state = self.state();
        if state.generation != generation {
            return None;
        }
        Some(f(&mut state))
    }

    fn set_status(&self, generation: u64, status: RoomStatus) {
        let changed = self.with_current(generation, |state| state.status = status.clone());
        if changed.is_some() {
            self.listener.on_status(&status);
        }
    }

    async fn teardown_current(&self) {
        let mut slot = self.subscription.lock().await;
        if let Some(mut handle) = slot.take() {
            debug!(room = %handle.room(), "tearing down subscription");
            self.transport.teardown(&mut handle).await;
        }
    }

    /// Load history, then subscribe, unless a newer generation takes over.
    async fn activate(self: &Arc<Self>, generation: u64, room: RoomId) -> Result<(), ChatError> {
        let history = match self.load_history_with_retry(generation, &room).await {
            LoadOutcome::Loaded(history) => history,
            LoadOutcome::Superseded => return Ok(()),
            LoadOutcome::Failed(e) => {
                self.set_status(
                    generation,
                    RoomStatus::Failed {
                        reason: e.to_string(),
                    },
                );
                if self.is_current(generation) {
                    self.listener.on_error(&e);
                }
                return Err(e);
            }
        };

        let mut slot = self.subscription.lock().await;
        if !self.is_current(generation) {
            return Ok(());
        }
        if let Some(mut stale) = slot.take() {
            self.transport.teardown(&mut stale).await;
        }

        let applied = self.with_current(generation, |state| {
            let mut merged: Vec<Entry> = history.iter().cloned().map(Entry::Confirmed).collect();
            merged.extend(state.entries.drain(..).filter(|entry| {
                let m = entry.message();
                !history
                    .iter()
                    .any(|h| h.address == m.address && h.timestamp == m.timestamp)
            }));
            state.entries = merged;
        });
        if applied.is_some() {
            self.listener.on_history_loaded(&history);
        }

        let subscribed = self
            .transport
            .subscribe(
                &room,
                self.config.local_address,
                self.message_callback(generation),
                self.status_callback(generation),
            )
            .await;
        let mut handle = match subscribed {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%room, error = %e, "subscribe failed");
                self.set_status(
                    generation,
                    RoomStatus::Failed {
                        reason: e.to_string(),
                    },
                );
                if self.is_current(generation) {
                    self.listener.on_error(&e);
                }
                return Err(e);
            }
        };

        if !self.is_current(generation) {
            self.transport.teardown(&mut handle).await;
            return Ok(());
        }
        *slot = Some(handle);
        drop(slot);
        self.set_status(generation, RoomStatus::Subscribed);
        info!(%room, messages = history.len(), "room subscribed");
        Ok(())
    }

    /// Up to `max_attempts` sequential loads, sleeping `attempt * backoff_step`
    /// after each failure.
    async fn load_history_with_retry(&self, generation: u64, room: &RoomId) -> LoadOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let window = self.transport.default_window();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if !self.is_current(generation) {
                return LoadOutcome::Superseded;
            }
            self.set_status(generation, RoomStatus::LoadingHistory { attempt });

            match self.transport.load_history(room, window).await {
                Ok(mut history) => {
                    if !self.is_current(generation) {
                        debug!(%room, "discarding history for a room no longer shown");
                        return LoadOutcome::Superseded;
                    }
                    history.sort_by_key(|m| m.timestamp);
                    return LoadOutcome::Loaded(history);
                }
                Err(e) => {
                    warn!(%room, attempt, max_attempts, error = %e, "history load failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff_step * attempt).await;
                    }
                }
            }
        }

        if !self.is_current(generation) {
            return LoadOutcome::Superseded;
        }
        LoadOutcome::Failed(ChatError::HistoryLoadFailed {
            room: room.clone(),
            attempts: max_attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn message_callback(self: &Arc<Self>, generation: u64) -> MessageCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |message: Message| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let appended = inner.with_current(generation, |state| {
                let duplicate = state.entries.iter().any(|e| {
                    let m = e.message();
                    m.address == message.address && m.timestamp == message.timestamp
                });
                if !duplicate {
                    state.entries.push(Entry::Confirmed(message.clone()));
                }
                !duplicate
            });
            if appended == Some(true) {
                inner.listener.on_message(&message);
            }
        })
    }

    fn status_callback(self: &Arc<Self>, generation: u64) -> StatusCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |connected| {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(generation) {
                    inner.listener.on_connection_status_change(connected);
                }
            }
        })
    }
}
