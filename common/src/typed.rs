//! EIP-712 structured signing for chat messages and the sign-in handshake.
//!
//! Only the two fixed struct types used by the chat are supported, so the
//! encoder is a direct implementation of `hashStruct` for string, uint256 and
//! address members rather than a general-purpose type parser.

use serde::{Deserialize, Serialize};

use crate::identity::{keccak256, Address};
use crate::message::{AuthPayload, MessagePayload};

/// Chain id the wallet is asked to sign under.
pub const HL_CHAIN_ID: u64 = 1337;

const DOMAIN_TYPE: &str = "EIP712Domain(string name,string version,uint256 chainId)";
const MESSAGE_TYPE: &str =
    "Message(string room,string content,uint256 timestamp,string nonce,string name)";
const AUTH_TYPE: &str = "Auth(address wallet,uint256 timestamp)";

/// The EIP-712 domain separator inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip712Domain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
}

impl Default for Eip712Domain {
    fn default() -> Self {
        Self {
            name: "HL Chat".to_string(),
            version: "1".to_string(),
            chain_id: HL_CHAIN_ID,
        }
    }
}

impl Eip712Domain {
    pub fn separator(&self) -> [u8; 32] {
        let mut enc = Encoder::new(DOMAIN_TYPE);
        enc.string(&self.name);
        enc.string(&self.version);
        enc.uint(self.chain_id);
        enc.finish()
    }
}

/// Typed data as sent over the wire: the domain plus one of the two structs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    pub domain: Eip712Domain,
    #[serde(flatten)]
    pub body: TypedBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "primaryType", content = "message")]
pub enum TypedBody {
    Message(MessagePayload),
    Auth(AuthPayload),
}

impl TypedData {
    pub fn message(domain: Eip712Domain, payload: MessagePayload) -> Self {
        Self {
            domain,
            body: TypedBody::Message(payload),
        }
    }

    pub fn auth(domain: Eip712Domain, payload: AuthPayload) -> Self {
        Self {
            domain,
            body: TypedBody::Auth(payload),
        }
    }

    /// The digest a wallet signs for `eth_signTypedData_v4`.
    pub fn signing_hash(&self) -> [u8; 32] {
        let struct_hash = match &self.body {
            TypedBody::Message(payload) => message_struct_hash(payload),
            TypedBody::Auth(payload) => auth_struct_hash(payload),
        };
        let mut data = Vec::with_capacity(66);
        data.extend_from_slice(&[0x19, 0x01]);
        data.extend_from_slice(&self.domain.separator());
        data.extend_from_slice(&struct_hash);
        keccak256(&data)
    }
}

fn message_struct_hash(payload: &MessagePayload) -> [u8; 32] {
    let mut enc = Encoder::new(MESSAGE_TYPE);
    enc.string(payload.room.as_str());
    enc.string(&payload.content);
    enc.uint(payload.timestamp);
    enc.string(&payload.nonce);
    enc.string(payload.name.as_deref().unwrap_or(""));
    enc.finish()
}

fn auth_struct_hash(payload: &AuthPayload) -> [u8; 32] {
    let mut enc = Encoder::new(AUTH_TYPE);
    enc.address(&payload.address);
    enc.uint(payload.timestamp);
    enc.finish()
}

/// `encodeData` accumulator: type hash followed by 32-byte words.
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new(type_signature: &str) -> Self {
        let mut buf = Vec::with_capacity(32 * 6);
        buf.extend_from_slice(&keccak256(type_signature.as_bytes()));
        Self { buf }
    }

    fn string(&mut self, value: &str) {
        self.buf.extend_from_slice(&keccak256(value.as_bytes()));
    }

    fn uint(&mut self, value: u64) {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        self.buf.extend_from_slice(&word);
    }

    fn address(&mut self, value: &Address) {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(value.as_bytes());
        self.buf.extend_from_slice(&word);
    }

    fn finish(self) -> [u8; 32] {
        keccak256(&self.buf)
    }
}
