//! The seam between the room synchronizer and a delivery network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hlchat_common::message::{generate_nonce, now_millis, truncate_content};
use hlchat_common::{
    Address, Eip712Domain, Message, MessagePayload, RoomId, SignatureScheme, TypedData,
};
use tokio::task::JoinHandle;

use crate::error::ChatError;
use crate::signer::WalletSigner;

/// Called for every remote message observed on a subscription.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
/// Called with `true` when a subscription (re)connects and `false` when it drops.
pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// How far back a history load reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    Unbounded,
    Last(Duration),
}

impl HistoryWindow {
    /// Earliest timestamp (ms) inside the window, relative to `now_ms`.
    pub fn since(&self, now_ms: u64) -> Option<u64> {
        match self {
            HistoryWindow::Unbounded => None,
            HistoryWindow::Last(span) => Some(now_ms.saturating_sub(span.as_millis() as u64)),
        }
    }
}

/// The exact bytes a signature covers.
#[derive(Debug, Clone)]
pub enum SignedForm {
    Plain(String),
    Typed(TypedData),
}

/// A signed message ready for [`Transport::send`].
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub pair: String,
    pub market: String,
    pub message: Message,
    pub signed: SignedForm,
}

impl OutgoingMessage {
    /// Truncate `content`, stamp it with a fresh nonce and the current time,
    /// and have `signer` sign it under `scheme`.
    pub async fn sign(
        signer: &dyn WalletSigner,
        pair: &str,
        market: &str,
        content: &str,
        name: Option<String>,
        scheme: SignatureScheme,
        domain: &Eip712Domain,
    ) -> Result<Self, ChatError> {
        let payload = MessagePayload {
            room: RoomId::new(pair, market),
            content: truncate_content(content),
            timestamp: now_millis(),
            nonce: generate_nonce(),
            name,
        };
        let (signature, signed) = match scheme {
            SignatureScheme::Personal => {
                let plain = payload.to_plain();
                (signer.sign_personal(&plain).await?, SignedForm::Plain(plain))
            }
            SignatureScheme::Typed => {
                let typed = TypedData::message(domain.clone(), payload.clone());
                (signer.sign_typed(&typed).await?, SignedForm::Typed(typed))
            }
        };
        Ok(Self {
            pair: pair.to_string(),
            market: market.to_string(),
            message: Message::from_signed(payload, signer.address(), signature, scheme),
            signed,
        })
    }
}

/// A live binding to one room on one transport.
///
/// Closing is idempotent: the first [`close`](Self::close) stops the
/// background tasks and returns `true`, later calls do nothing.
pub struct SubscriptionHandle {
    room: RoomId,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(room: RoomId, closed: Arc<AtomicBool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            room,
            closed,
            tasks,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&mut self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        true
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// True when `message` was sent by the local wallet and must not be re-delivered.
pub fn is_self_echo(local: Option<Address>, message: &Message) -> bool {
    local == Some(message.address)
}

/// A way of moving chat messages: the central relay or the peer mesh.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepare the transport to send on behalf of `signer`.
    async fn authorize(&self, _signer: &dyn WalletSigner) -> Result<(), ChatError> {
        Ok(())
    }

    fn default_window(&self) -> HistoryWindow;

    async fn load_history(
        &self,
        room: &RoomId,
        window: HistoryWindow,
    ) -> Result<Vec<Message>, ChatError>;

    /// Start delivering `room`'s messages to `on_message`, skipping those sent
    /// by `local` (compared on the parsed address, so case never matters).
    async fn subscribe(
        &self,
        room: &RoomId,
        local: Option<Address>,
        on_message: MessageCallback,
        on_status: StatusCallback,
    ) -> Result<SubscriptionHandle, ChatError>;

    async fn send(&self, outgoing: &OutgoingMessage) -> Result<Message, ChatError>;

    /// Close `handle`. Safe to call on an already-closed handle.
    async fn teardown(&self, handle: &mut SubscriptionHandle) {
        handle.close();
    }
}
