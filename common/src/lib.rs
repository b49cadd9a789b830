pub mod identity;
pub mod message;
pub mod typed;
pub mod wire;

pub use identity::{Address, LocalWallet, SignatureError, WalletSignature};
pub use message::{AuthPayload, Message, MessagePayload, RoomId, SignatureScheme};
pub use typed::{Eip712Domain, TypedData};
