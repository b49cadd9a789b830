//! [`MeshNode`] backed by an nwaku node's REST API.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::mesh::{Capability, MeshNode};

/// Shard most public nwaku fleets route application traffic on.
pub const DEFAULT_PUBSUB_TOPIC: &str = "/waku/2/rs/0/0";

/// Upper bound on store pages followed for one history query.
const MAX_STORE_PAGES: usize = 10;
const STORE_PAGE_SIZE: usize = 100;
/// Bound on every REST call to the node.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WakuRestNode {
    http: reqwest::Client,
    base: Url,
    pubsub_topic: String,
}

// ─── REST shapes ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PeerInfo {
    #[serde(default)]
    protocols: Vec<PeerProtocol>,
}

/// Older nodes list `{protocol, connected}` objects, newer ones bare strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum PeerProtocol {
    Detailed { protocol: String, connected: bool },
    Named(String),
}

impl PeerProtocol {
    fn offers(&self, capability: Capability) -> bool {
        let (protocol, connected) = match self {
            PeerProtocol::Detailed {
                protocol,
                connected,
            } => (protocol.as_str(), *connected),
            PeerProtocol::Named(protocol) => (protocol.as_str(), true),
        };
        connected
            && match capability {
                Capability::Store => protocol.contains("/waku/store"),
                Capability::LightPush => protocol.contains("/waku/lightpush"),
                Capability::Filter => protocol.contains("/waku/filter"),
            }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WakuMessage {
    payload: String,
    content_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreResponse {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    status_desc: Option<String>,
    #[serde(default)]
    messages: Vec<StoredEntry>,
    #[serde(default)]
    pagination_cursor: Option<String>,
}

#[derive(Deserialize)]
struct StoredEntry {
    message: Option<WakuMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    pubsub_topic: &'a str,
    message: WakuMessage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterRequest<'a> {
    request_id: String,
    content_filters: [&'a str; 1],
    pubsub_topic: &'a str,
}

// ─── Node ────────────────────────────────────────────────────────────────────

impl WakuRestNode {
    pub fn new(base_url: &str) -> Result<Self, ChatError> {
        Self::with_pubsub_topic(base_url, DEFAULT_PUBSUB_TOPIC)
    }

    pub fn with_pubsub_topic(base_url: &str, pubsub_topic: &str) -> Result<Self, ChatError> {
        let base = Url::parse(base_url)
            .map_err(|e| ChatError::Network(format!("invalid nwaku URL: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base,
            pubsub_topic: pubsub_topic.to_string(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Network("nwaku URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn filter_request<'a>(&'a self, topic: &'a str) -> FilterRequest<'a> {
        FilterRequest {
            request_id: format!("{:016x}", rand::random::<u64>()),
            content_filters: [topic],
            pubsub_topic: &self.pubsub_topic,
        }
    }
}

fn decode_payload(message: &WakuMessage) -> Option<Vec<u8>> {
    match STANDARD.decode(&message.payload) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(topic = %message.content_topic, error = %e, "skipping non-base64 payload");
            None
        }
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ChatError::Network(format!("nwaku returned {status}: {body}")))
}

#[async_trait]
impl MeshNode for WakuRestNode {
    async fn capable_peers(&self, capability: Capability) -> Result<usize, ChatError> {
        let resp = self.http.get(self.endpoint(&["admin", "v1", "peers"])?).send().await?;
        let peers: Vec<PeerInfo> = check(resp).await?.json().await?;
        Ok(peers
            .iter()
            .filter(|peer| peer.protocols.iter().any(|p| p.offers(capability)))
            .count())
    }

    async fn query_store(
        &self,
        topic: &str,
        start_ms: Option<u64>,
    ) -> Result<Vec<Vec<u8>>, ChatError> {
        let mut payloads = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_STORE_PAGES {
            let mut url = self.endpoint(&["store", "v3", "messages"])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("pubsubTopic", &self.pubsub_topic)
                    .append_pair("contentTopics", topic)
                    .append_pair("includeData", "true")
                    .append_pair("ascending", "true")
                    .append_pair("pageSize", &STORE_PAGE_SIZE.to_string());
                if let Some(start) = start_ms {
                    // nwaku timestamps are nanoseconds.
                    query.append_pair("startTime", &(start as u128 * 1_000_000).to_string());
                }
                if let Some(cursor) = &cursor {
                    query.append_pair("cursor", cursor);
                }
            }

            let resp = self.http.get(url).send().await?;
            let page: StoreResponse = check(resp).await?.json().await?;
            if let Some(code) = page.status_code.filter(|code| *code != 200) {
                return Err(ChatError::Network(format!(
                    "store query failed ({code}): {}",
                    page.status_desc.unwrap_or_default()
                )));
            }
            payloads.extend(
                page.messages
                    .iter()
                    .filter_map(|entry| entry.message.as_ref())
                    .filter_map(decode_payload),
            );
            match page.pagination_cursor {
                Some(next) if !page.messages.is_empty() => cursor = Some(next),
                _ => return Ok(payloads),
            }
        }
        warn!(%topic, pages = MAX_STORE_PAGES, "store history truncated");
        Ok(payloads)
    }

    async fn push(&self, topic: &str, payload: Vec<u8>, timestamp_ms: u64) -> Result<(), ChatError> {
        let request = PushRequest {
            pubsub_topic: &self.pubsub_topic,
            message: WakuMessage {
                payload: STANDARD.encode(payload),
                content_topic: topic.to_string(),
                timestamp: Some((timestamp_ms as i64).saturating_mul(1_000_000)),
            },
        };
        let resp = self
            .http
            .post(self.endpoint(&["lightpush", "v1", "message"])?)
            .json(&request)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ChatError> {
        let resp = self
            .http
            .post(self.endpoint(&["filter", "v2", "subscriptions"])?)
            .json(&self.filter_request(topic))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ChatError> {
        let resp = self
            .http
            .delete(self.endpoint(&["filter", "v2", "subscriptions"])?)
            .json(&self.filter_request(topic))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn poll(&self, topic: &str) -> Result<Vec<Vec<u8>>, ChatError> {
        let resp = self
            .http
            .get(self.endpoint(&["filter", "v2", "messages", topic])?)
            .send()
            .await?;
        let messages: Vec<WakuMessage> = check(resp).await?.json().await?;
        Ok(messages.iter().filter_map(decode_payload).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Requests seen by the stand-in nwaku node.
    #[derive(Default)]
    struct Seen {
        store_queries: Mutex<Vec<HashMap<String, String>>>,
        pushes: Mutex<Vec<Value>>,
        filters: Mutex<Vec<(&'static str, Value)>>,
    }

    fn waku_message(text: &str) -> Value {
        json!({"payload": STANDARD.encode(text), "contentTopic": "/t", "timestamp": 1})
    }

    async fn peers() -> Json<Value> {
        Json(json!([
            {"multiaddr": "/ip4/1.2.3.4", "protocols": ["/vac/waku/store-query/3.0.0"]},
            {"multiaddr": "/ip4/5.6.7.8", "protocols": [
                {"protocol": "/vac/waku/lightpush/2.0.0-beta1", "connected": true}
            ]}
        ]))
    }

    async fn store(
        State(seen): State<Arc<Seen>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, StatusCode> {
        seen.store_queries.lock().unwrap().push(query.clone());
        match (query["contentTopics"].as_str(), query.get("cursor").map(String::as_str)) {
            ("/down", _) => Err(StatusCode::SERVICE_UNAVAILABLE),
            ("/refused", _) => Ok(Json(json!({"statusCode": 503, "statusDesc": "no peers"}))),
            (_, None) => Ok(Json(json!({
                "statusCode": 200,
                "messages": [{"message": waku_message("one")}, {"message": waku_message("two")}],
                "paginationCursor": "page-2"
            }))),
            (_, Some(_)) => Ok(Json(json!({
                "statusCode": 200,
                "messages": [{"message": waku_message("three")}],
                "paginationCursor": null
            }))),
        }
    }

    async fn lightpush(State(seen): State<Arc<Seen>>, Json(body): Json<Value>) -> StatusCode {
        seen.pushes.lock().unwrap().push(body);
        StatusCode::OK
    }

    async fn filter_subscribe(State(seen): State<Arc<Seen>>, Json(body): Json<Value>) -> StatusCode {
        seen.filters.lock().unwrap().push(("subscribe", body));
        StatusCode::OK
    }

    async fn filter_delete(State(seen): State<Arc<Seen>>, Json(body): Json<Value>) -> StatusCode {
        seen.filters.lock().unwrap().push(("unsubscribe", body));
        StatusCode::OK
    }

    async fn filter_messages(Path(topic): Path<String>) -> Result<Json<Value>, StatusCode> {
        if topic == "/hl-chat/1/BTC_perp/proto" {
            Ok(Json(json!([waku_message("live"), {"payload": "%%%", "contentTopic": "/t"}])))
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    }

    async fn spawn_node() -> (WakuRestNode, Arc<Seen>) {
        let seen = Arc::new(Seen::default());
        let app = Router::new()
            .route("/admin/v1/peers", get(peers))
            .route("/store/v3/messages", get(store))
            .route("/lightpush/v1/message", post(lightpush))
            .route(
                "/filter/v2/subscriptions",
                post(filter_subscribe).delete(filter_delete),
            )
            .route("/filter/v2/messages/{topic}", get(filter_messages))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let node = WakuRestNode::with_pubsub_topic(&format!("http://{addr}"), "/waku/2/rs/1/4").unwrap();
        (node, seen)
    }

    #[tokio::test]
    async fn peer_counts_from_admin_endpoint() {
        let (node, _) = spawn_node().await;
        assert_eq!(node.capable_peers(Capability::Store).await.unwrap(), 1);
        assert_eq!(node.capable_peers(Capability::LightPush).await.unwrap(), 1);
        assert_eq!(node.capable_peers(Capability::Filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_query_follows_cursor_with_nanosecond_start() {
        let (node, seen) = spawn_node().await;
        let payloads = node.query_store("/hl-chat/1/BTC_perp/proto", Some(1_700_000_000_123)).await.unwrap();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        let queries = seen.store_queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0]["startTime"], "1700000000123000000");
        assert_eq!(queries[0]["pubsubTopic"], "/waku/2/rs/1/4");
        assert_eq!(queries[0]["includeData"], "true");
        assert!(!queries[0].contains_key("cursor"));
        assert_eq!(queries[1]["cursor"], "page-2");
    }

    #[tokio::test]
    async fn store_failures_are_network_errors() {
        let (node, _) = spawn_node().await;
        let err = node.query_store("/down", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(ref m) if m.contains("503")));
        let err = node.query_store("/refused", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(ref m) if m.contains("no peers")));
    }

    #[tokio::test]
    async fn push_sends_base64_payload_and_nanosecond_timestamp() {
        let (node, seen) = spawn_node().await;
        node.push("/hl-chat/1/BTC_perp/proto", b"hello".to_vec(), 1_000).await.unwrap();

        let pushes = seen.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0]["pubsubTopic"], "/waku/2/rs/1/4");
        assert_eq!(pushes[0]["message"]["payload"], STANDARD.encode("hello"));
        assert_eq!(pushes[0]["message"]["contentTopic"], "/hl-chat/1/BTC_perp/proto");
        assert_eq!(pushes[0]["message"]["timestamp"], 1_000_000_000i64);
    }

    #[tokio::test]
    async fn filter_lifecycle() {
        let (node, seen) = spawn_node().await;
        let topic = "/hl-chat/1/BTC_perp/proto";
        node.subscribe(topic).await.unwrap();
        assert_eq!(node.poll(topic).await.unwrap(), vec![b"live".to_vec()]);
        node.unsubscribe(topic).await.unwrap();

        let filters = seen.filters.lock().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].0, "subscribe");
        assert_eq!(filters[0].1["contentFilters"], json!([topic]));
        assert_eq!(filters[1].0, "unsubscribe");
        drop(filters);

        let err = node.poll("/elsewhere").await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
    }

    #[test]
    fn peer_protocols_in_both_shapes() {
        let peers: Vec<PeerInfo> = serde_json::from_str(
            r#"[
                {"multiaddr":"/ip4/1.2.3.4","protocols":[
                    {"protocol":"/vac/waku/store-query/3.0.0","connected":true},
                    {"protocol":"/vac/waku/lightpush/2.0.0-beta1","connected":false}
                ]},
                {"multiaddr":"/ip4/5.6.7.8","protocols":["/vac/waku/filter-subscribe/2.0.0-beta1"]}
            ]"#,
        )
        .unwrap();
        let count = |cap| {
            peers
                .iter()
                .filter(|p| p.protocols.iter().any(|proto| proto.offers(cap)))
                .count()
        };
        assert_eq!(count(Capability::Store), 1);
        assert_eq!(count(Capability::LightPush), 0);
        assert_eq!(count(Capability::Filter), 1);
    }

    #[test]
    fn content_topic_is_one_encoded_segment() {
        let node = WakuRestNode::new("http://127.0.0.1:8645").unwrap();
        let url = node
            .endpoint(&["filter", "v2", "messages", "/hl-chat/1/BTC_perp/proto"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8645/filter/v2/messages/%2Fhl-chat%2F1%2FBTC_perp%2Fproto"
        );
    }

    #[test]
    fn store_page_decodes_payloads() {
        let page: StoreResponse = serde_json::from_str(
            r#"{"requestId":"x","statusCode":200,"statusDesc":"OK",
                "messages":[{"messageHash":"0x01","message":{"payload":"aGk=","contentTopic":"/t","timestamp":1}},
                            {"messageHash":"0x02"}],
                "paginationCursor":null}"#,
        )
        .unwrap();
        let decoded: Vec<Vec<u8>> = page
            .messages
            .iter()
            .filter_map(|e| e.message.as_ref())
            .filter_map(decode_payload)
            .collect();
        assert_eq!(decoded, vec![b"hi".to_vec()]);
    }
}
