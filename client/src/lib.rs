//! HL Chat client: transports to the gateway or the peer mesh, and the room
//! synchronizer that keeps a market's chat in view.

pub mod error;
pub mod mesh;
pub mod relay;
pub mod signer;
pub mod synchronizer;
pub mod transport;
pub mod waku;

pub use error::ChatError;
pub use mesh::{Capability, MeshConfig, MeshNode, MeshTransport};
pub use relay::{RelayConfig, RelayTransport};
pub use signer::WalletSigner;
pub use synchronizer::{
    Entry, NoopListener, RoomSource, RoomStatus, RoomSynchronizer, SyncConfig, SyncListener,
};
pub use transport::{HistoryWindow, OutgoingMessage, SubscriptionHandle, Transport};
pub use waku::WakuRestNode;
