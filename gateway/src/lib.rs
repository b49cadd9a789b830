//! HL Chat message gateway.
//!
//! Verifies wallet-signed chat messages, guards against replay and flooding,
//! persists what it accepts and fans it out to live subscribers.

pub mod auth;
pub mod config;
pub mod guard;
pub mod names;
pub mod routes;
pub mod session;
pub mod store;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use auth::{AuthError, Gateway, SignIn, SignedPayload, Submission};
pub use config::GatewayConfig;
pub use routes::router;

/// Run [`Gateway::sweep`] every `sweep_interval` until the handle is aborted.
pub fn spawn_sweeper(gateway: Arc<Gateway>) -> JoinHandle<()> {
    let period = gateway.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            gateway.sweep();
        }
    })
}
