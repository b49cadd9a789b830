use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{Address, SignatureError, WalletSignature};
use crate::typed::{Eip712Domain, TypedData};

/// Maximum message length in characters, enforced by truncation.
pub const MAX_CONTENT_CHARS: usize = 500;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A fresh random nonce (hex-encoded 16 bytes).
pub fn generate_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Cut `content` down to [`MAX_CONTENT_CHARS`] characters (not bytes).
pub fn truncate_content(content: &str) -> String {
    match content.char_indices().nth(MAX_CONTENT_CHARS) {
        Some((idx, _)) => content[..idx].to_string(),
        None => content.to_string(),
    }
}

/// A chat room: `"{pair}_{market}"`, compared as an exact, case-sensitive string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(pair: &str, market: &str) -> Self {
        RoomId(format!("{pair}_{market}"))
    }

    /// Wrap an already-composed room key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        RoomId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Content topic the mesh network routes this room's traffic on.
    pub fn content_topic(&self) -> String {
        format!("/hl-chat/1/{}/proto", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the signature on a message was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// EIP-191 `personal_sign` over [`MessagePayload::to_plain`].
    #[default]
    Personal,
    /// EIP-712 over [`TypedData::message`] with the default domain.
    Typed,
}

/// The exact payload a sender signs.
///
/// Field order matters: the plain form is this struct's compact JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub room: RoomId,
    pub content: String,
    pub timestamp: u64,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MessagePayload {
    /// The string handed to `personal_sign`.
    pub fn to_plain(&self) -> String {
        // Serializing a struct of strings and integers cannot fail.
        serde_json::to_string(self).expect("payload serialization should not fail")
    }

    pub fn from_plain(plain: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(plain)
    }
}

/// Sign-in payload exchanged for a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub address: Address,
    pub timestamp: u64,
}

impl AuthPayload {
    pub fn to_plain(&self) -> String {
        format!(
            "Sign in to HL Chat\naddress: {}\ntimestamp: {}",
            self.address, self.timestamp
        )
    }
}

/// One chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub room: RoomId,
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub content: String,
    pub timestamp: u64,
    pub nonce: String,
    pub signature: WalletSignature,
    #[serde(default)]
    pub scheme: SignatureScheme,
}

impl Message {
    /// Assemble a message from the payload its sender signed.
    pub fn from_signed(
        payload: MessagePayload,
        address: Address,
        signature: WalletSignature,
        scheme: SignatureScheme,
    ) -> Self {
        Self {
            room: payload.room,
            address,
            display_name: payload.name,
            content: payload.content,
            timestamp: payload.timestamp,
            nonce: payload.nonce,
            signature,
            scheme,
        }
    }

    pub fn payload(&self) -> MessagePayload {
        MessagePayload {
            room: self.room.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            nonce: self.nonce.clone(),
            name: self.display_name.clone(),
        }
    }

    /// Recover the signer of this message's payload under its scheme.
    pub fn recover_signer(&self) -> Result<Address, SignatureError> {
        match self.scheme {
            SignatureScheme::Personal => self.signature.recover_personal(&self.payload().to_plain()),
            SignatureScheme::Typed => {
                let typed = TypedData::message(Eip712Domain::default(), self.payload());
                self.signature.recover(&typed.signing_hash())
            }
        }
    }

    /// True when the embedded signature recovers to `address`.
    pub fn is_authentic(&self) -> bool {
        self.recover_signer().map(|a| a == self.address).unwrap_or(false)
    }
}
