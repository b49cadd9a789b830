use hlchat_common::wire::WireError;
use hlchat_common::{RoomId, SignatureError};

use crate::mesh::Capability;

/// Every failure a chat client can surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("signature does not match address")]
    SignatureMismatch,
    #[error("stale timestamp")]
    StaleTimestamp,
    #[error("nonce already used")]
    NonceReused,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("name not owned: {0}")]
    NameNotOwned(String),
    #[error("session required")]
    SessionRequired,
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("no peer offers {0}")]
    NoCapablePeer(Capability),
    #[error("history for {room} failed after {attempts} attempts: {reason}")]
    HistoryLoadFailed {
        room: RoomId,
        attempts: u32,
        reason: String,
    },
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("no room selected")]
    NoRoom,
    #[error("signer error: {0}")]
    Signer(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ChatError {
    /// Classify a gateway rejection from its status and `{error}` text.
    pub fn from_gateway(status: u16, error: &str) -> Self {
        let lower = error.to_lowercase();
        if status == 429 || lower.contains("rate limit") {
            return ChatError::RateLimited;
        }
        if status >= 500 {
            return if lower.contains("storage") {
                ChatError::StorageError(error.to_string())
            } else {
                ChatError::SendFailed(error.to_string())
            };
        }
        if lower.starts_with("invalid payload") {
            ChatError::SendFailed(error.to_string())
        } else if lower.contains("nonce") {
            ChatError::NonceReused
        } else if lower.contains("timestamp") {
            ChatError::StaleTimestamp
        } else if lower.contains("signature") {
            ChatError::SignatureMismatch
        } else if lower.contains("session") {
            ChatError::SessionRequired
        } else if lower.contains("name") {
            ChatError::NameNotOwned(error.to_string())
        } else {
            ChatError::SendFailed(error.to_string())
        }
    }

    /// Text suitable for showing to the person at the keyboard.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::RateLimited => {
                "You're sending messages too fast. Wait a moment and try again.".into()
            }
            ChatError::StaleTimestamp => {
                "Your clock looks out of sync. Check your system time and try again.".into()
            }
            ChatError::SignatureMismatch => {
                "The signature didn't match your wallet. Reconnect your wallet and try again."
                    .into()
            }
            ChatError::NonceReused => "This message was already sent.".into(),
            ChatError::NameNotOwned(_) => "Your wallet doesn't own that display name.".into(),
            ChatError::SessionRequired => "Sign in with your wallet before chatting.".into(),
            ChatError::NoCapablePeer(_) => {
                "No chat peers are reachable right now. Try again shortly.".into()
            }
            ChatError::HistoryLoadFailed { .. } => {
                "Couldn't load chat history for this room. Retry to try again.".into()
            }
            ChatError::NoRoom => "Pick a market to start chatting.".into(),
            ChatError::Signer(_) => "Your wallet didn't sign the message.".into(),
            ChatError::StorageError(_) | ChatError::SendFailed(_) => {
                "Message could not be delivered. Please try again.".into()
            }
            ChatError::Network(_) | ChatError::Decode(_) => {
                "Connection problem. Check your network and try again.".into()
            }
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Network(e.to_string())
    }
}

impl From<WireError> for ChatError {
    fn from(e: WireError) -> Self {
        ChatError::Decode(e.to_string())
    }
}

impl From<SignatureError> for ChatError {
    fn from(e: SignatureError) -> Self {
        ChatError::Signer(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_are_classified() {
        assert!(matches!(
            ChatError::from_gateway(429, "rate limit exceeded, slow down"),
            ChatError::RateLimited
        ));
        assert!(matches!(
            ChatError::from_gateway(400, "nonce already used"),
            ChatError::NonceReused
        ));
        assert!(matches!(
            ChatError::from_gateway(400, "stale timestamp: outside the accepted window"),
            ChatError::StaleTimestamp
        ));
        assert!(matches!(
            ChatError::from_gateway(400, "signature does not match address"),
            ChatError::SignatureMismatch
        ));
        assert!(matches!(
            ChatError::from_gateway(400, "name 'x.hl' is not owned by this address"),
            ChatError::NameNotOwned(_)
        ));
        assert!(matches!(
            ChatError::from_gateway(500, "storage error: insert timed out"),
            ChatError::StorageError(_)
        ));
        assert!(matches!(
            ChatError::from_gateway(500, "name registry unavailable: HTTP 503"),
            ChatError::SendFailed(_)
        ));
        assert!(matches!(
            ChatError::from_gateway(400, "invalid payload: claimed name differs from the signed one"),
            ChatError::SendFailed(_)
        ));
    }

    #[test]
    fn user_messages_never_leak_internals() {
        let err = ChatError::StorageError("relation \"messages\" does not exist".into());
        assert!(!err.user_message().contains("relation"));
        assert!(ChatError::RateLimited.user_message().contains("too fast"));
    }
}
