//! Harness for running a gateway in-process and talking to it over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hlchat_client::{ChatError, SyncListener};
use hlchat_common::Message;
use hlchat_gateway::names::{NameRegistry, StaticNameRegistry};
use hlchat_gateway::store::MemoryMessageStore;
use hlchat_gateway::{router, Gateway, GatewayConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct TestGateway {
    pub url: String,
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    pub store: Arc<MemoryMessageStore>,
    server: JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Serve a gateway on an ephemeral localhost port.
pub async fn spawn_gateway(config: GatewayConfig) -> TestGateway {
    spawn_gateway_with_registry(config, Arc::new(StaticNameRegistry::default())).await
}

pub async fn spawn_gateway_with_registry(
    config: GatewayConfig,
    registry: Arc<dyn NameRegistry>,
) -> TestGateway {
    let store = Arc::new(MemoryMessageStore::default());
    let gateway = Arc::new(Gateway::new(config, store.clone(), registry));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = router(gateway.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("gateway server failed");
    });
    TestGateway {
        url: format!("http://{addr}"),
        addr,
        gateway,
        store,
        server,
    }
}

/// Forwards everything a synchronizer reports onto channels.
pub struct ChannelListener {
    messages: mpsc::UnboundedSender<Message>,
    errors: mpsc::UnboundedSender<String>,
}

impl ChannelListener {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (messages, message_rx) = mpsc::unbounded_channel();
        let (errors, error_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { messages, errors }), message_rx, error_rx)
    }
}

impl SyncListener for ChannelListener {
    fn on_message(&self, message: &Message) {
        let _ = self.messages.send(message.clone());
    }

    fn on_error(&self, error: &ChatError) {
        let _ = self.errors.send(error.to_string());
    }
}

/// Wait for a message matching a predicate, with timeout.
/// Non-matching messages are logged and discarded.
pub async fn recv_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<Message>,
    predicate: F,
    timeout: Duration,
) -> Option<Message>
where
    F: Fn(&Message) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(message)) if predicate(&message) => return Some(message),
            Ok(Some(other)) => {
                tracing::debug!("Discarding non-matching message: {:?}", other.content);
                continue;
            }
            Ok(None) => return None,
            Err(_) => return None, // timeout
        }
    }
}
