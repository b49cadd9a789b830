//! Transport over a peer-to-peer relay mesh.
//!
//! There is no gateway here: whoever holds a node can push any record onto a
//! room's content topic. Receivers therefore re-verify every signature and
//! drop nonces they have already seen, but nothing stops a sender from
//! flooding, so authenticity on this path is advisory. Treat a verified mesh
//! message as "signed by that wallet", never as "accepted by the gateway".

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hlchat_common::message::now_millis;
use hlchat_common::{wire, Address, Message, RoomId};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::transport::{
    is_self_echo, HistoryWindow, MessageCallback, OutgoingMessage, StatusCallback,
    SubscriptionHandle, Transport,
};

/// A service a mesh peer may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Historical queries.
    Store,
    /// Publishing on behalf of a light client.
    LightPush,
    /// Pushing live traffic for a topic to a light client.
    Filter,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Store => "store",
            Capability::LightPush => "lightpush",
            Capability::Filter => "filter",
        })
    }
}

/// The local handle on the mesh: a light node or a REST proxy to one.
#[async_trait]
pub trait MeshNode: Send + Sync + 'static {
    /// Number of connected peers currently offering `capability`.
    async fn capable_peers(&self, capability: Capability) -> Result<usize, ChatError>;

    /// Stored payloads on `topic` at or after `start_ms`.
    async fn query_store(&self, topic: &str, start_ms: Option<u64>)
        -> Result<Vec<Vec<u8>>, ChatError>;

    async fn push(&self, topic: &str, payload: Vec<u8>, timestamp_ms: u64) -> Result<(), ChatError>;

    async fn subscribe(&self, topic: &str) -> Result<(), ChatError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ChatError>;

    /// Payloads received on a subscribed `topic` since the previous poll.
    async fn poll(&self, topic: &str) -> Result<Vec<Vec<u8>>, ChatError>;
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// How long to wait for a capable peer before giving up.
    pub peer_timeout: Duration,
    pub peer_poll_interval: Duration,
    /// Period of the filter poll on a live subscription.
    pub receive_interval: Duration,
    pub history_window: Duration,
    /// Drop records whose signature does not recover to their address.
    pub verify_signatures: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(6),
            peer_poll_interval: Duration::from_millis(250),
            receive_interval: Duration::from_secs(1),
            history_window: Duration::from_secs(12 * 60 * 60),
            verify_signatures: true,
        }
    }
}

/// `(sender, nonce)` pairs already delivered by one transport, forgotten
/// once they are older than the history window.
struct SeenNonces {
    entries: DashMap<(Address, String), Instant>,
    ttl: Duration,
}

impl SeenNonces {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record `(address, nonce)`. Returns `false` if it was seen within the TTL.
    fn insert(&self, address: Address, nonce: &str) -> bool {
        let now = Instant::now();
        let mut fresh = true;
        self.entries
            .entry((address, nonce.to_string()))
            .and_modify(|at| {
                fresh = now.duration_since(*at) >= self.ttl;
                if fresh {
                    *at = now;
                }
            })
            .or_insert(now);
        fresh
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, at| now.duration_since(*at) < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct MeshTransport<N: MeshNode> {
    node: Arc<N>,
    config: MeshConfig,
    seen: Arc<SeenNonces>,
}

impl<N: MeshNode> MeshTransport<N> {
    pub fn new(node: Arc<N>, config: MeshConfig) -> Self {
        Self {
            node,
            seen: Arc::new(SeenNonces::new(config.history_window)),
            config,
        }
    }

    /// Poll until some peer offers `capability`, or fail after `peer_timeout`.
    async fn wait_for(&self, capability: Capability) -> Result<(), ChatError> {
        let deadline = Instant::now() + self.config.peer_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.node.capable_peers(capability)).await {
                Ok(Ok(n)) if n > 0 => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(%capability, error = %e, "peer query failed"),
                Err(_) => debug!(%capability, "peer query did not answer in time"),
            }
            if Instant::now() >= deadline {
                warn!(%capability, "no capable peer within timeout");
                return Err(ChatError::NoCapablePeer(capability));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.peer_poll_interval.min(left)).await;
        }
    }
}

/// Decode one mesh record and check it belongs to `room` and is signed by its sender.
fn admit(bytes: &[u8], room: &RoomId, verify: bool) -> Option<Message> {
    let message = match wire::decode(bytes) {
        Ok(message) => message,
        Err(e) => {
            debug!(%room, error = %e, "dropping undecodable mesh record");
            return None;
        }
    };
    if &message.room != room {
        return None;
    }
    if verify && !message.is_authentic() {
        warn!(%room, address = %message.address, "dropping mesh record with bad signature");
        return None;
    }
    Some(message)
}

#[async_trait]
impl<N: MeshNode> Transport for MeshTransport<N> {
    fn default_window(&self) -> HistoryWindow {
        HistoryWindow::Last(self.config.history_window)
    }

    async fn load_history(
        &self,
        room: &RoomId,
        window: HistoryWindow,
    ) -> Result<Vec<Message>, ChatError> {
        self.wait_for(Capability::Store).await?;
        let records = self
            .node
            .query_store(&room.content_topic(), window.since(now_millis()))
            .await?;

        let mut unique = std::collections::HashSet::new();
        let mut messages: Vec<Message> = records
            .iter()
            .filter_map(|bytes| admit(bytes, room, self.config.verify_signatures))
            .filter(|m| unique.insert((m.address, m.nonce.clone())))
            .collect();
        let expired = self.seen.sweep();
        if expired > 0 {
            debug!(%room, expired, "forgot mesh nonces older than the history window");
        }
        for m in &messages {
            self.seen.insert(m.address, &m.nonce);
        }
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
        self.wait_for(Capability::Filter).await?;
        let topic = room.content_topic();
        self.node.subscribe(&topic).await?;
        on_status(true);

        let closed = Arc::new(AtomicBool::new(false));
        let node = self.node.clone();
        let seen = self.seen.clone();
        let verify = self.config.verify_signatures;
        let interval = self.config.receive_interval;
        let room_id = room.clone();
        let flag = closed.clone();

        let task = tokio::spawn(async move {
            let mut connected = true;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !flag.load(Ordering::SeqCst) {
                ticker.tick().await;
                seen.sweep();
                match node.poll(&topic).await {
                    Ok(batch) => {
                        if !connected {
                            connected = true;
                            on_status(true);
                        }
                        for bytes in batch {
                            let Some(message) = admit(&bytes, &room_id, verify) else {
                                continue;
                            };
                            if is_self_echo(local, &message)
                                || !seen.insert(message.address, &message.nonce)
                            {
                                continue;
                            }
                            if flag.load(Ordering::SeqCst) {
                                return;
                            }
                            on_message(message);
                        }
                    }
                    Err(e) => {
                        if connected {
                            warn!(room = %room_id, error = %e, "mesh filter poll failed");
                            connected = false;
                            on_status(false);
                        }
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(room.clone(), closed, vec![task]))
    }

    async fn send(&self, outgoing: &OutgoingMessage) -> Result<Message, ChatError> {
        self.wait_for(Capability::LightPush).await?;
        let message = &outgoing.message;
        let bytes = wire::encode(message)?;
        self.node
            .push(&message.room.content_topic(), bytes, message.timestamp)
            .await
            .map_err(|e| ChatError::SendFailed(e.to_string()))?;
        self.seen.insert(message.address, &message.nonce);
        debug!(room = %message.room, nonce = %message.nonce, "pushed to mesh");
        Ok(message.clone())
    }

    async fn teardown(&self, handle: &mut SubscriptionHandle) {
        if !handle.close() {
            return;
        }
        let topic = handle.room().content_topic();
        if let Err(e) = self.node.unsubscribe(&topic).await {
            warn!(%topic, error = %e, "mesh unsubscribe failed");
        }
    }
}
