//! Compact binary record pushed into the mesh network.
//!
//! Addresses and signatures travel as raw bytes rather than hex strings, which
//! roughly halves the record size compared to the JSON form used by the relay.

use serde::{Deserialize, Serialize};

use crate::identity::{Address, WalletSignature};
use crate::message::{Message, RoomId, SignatureScheme};

/// Bumped whenever the record layout changes.
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed record: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("signature must be 65 bytes, got {0}")]
    BadSignatureLength(usize),
}

#[derive(Serialize, Deserialize)]
struct MeshRecord {
    version: u8,
    room: String,
    address: [u8; 20],
    display_name: Option<String>,
    content: String,
    timestamp: u64,
    nonce: String,
    signature: Vec<u8>,
    typed: bool,
}

/// Encode a message into its mesh wire form.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let record = MeshRecord {
        version: WIRE_VERSION,
        room: message.room.as_str().to_string(),
        address: message.address.0,
        display_name: message.display_name.clone(),
        content: message.content.clone(),
        timestamp: message.timestamp,
        nonce: message.nonce.clone(),
        signature: message.signature.0.to_vec(),
        typed: message.scheme == SignatureScheme::Typed,
    };
    Ok(bincode::serialize(&record)?)
}

/// Decode a mesh wire record.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let record: MeshRecord = bincode::deserialize(bytes)?;
    if record.version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(record.version));
    }
    let signature: [u8; 65] = record
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| WireError::BadSignatureLength(record.signature.len()))?;
    Ok(Message {
        room: RoomId::from_raw(record.room),
        address: Address(record.address),
        display_name: record.display_name,
        content: record.content,
        timestamp: record.timestamp,
        nonce: record.nonce,
        signature: WalletSignature(signature),
        scheme: if record.typed {
            SignatureScheme::Typed
        } else {
            SignatureScheme::Personal
        },
    })
}
