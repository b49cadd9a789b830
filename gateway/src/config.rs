use std::time::Duration;

use hlchat_common::Eip712Domain;
use tracing::warn;

/// Tunables for the message gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum clock skew accepted on a chat message.
    pub message_window: Duration,
    /// Maximum clock skew accepted on a sign-in payload.
    pub auth_window: Duration,
    /// How long a consumed nonce is remembered.
    pub nonce_ttl: Duration,
    /// Period of the background sweep over nonces, rate windows, sessions and names.
    pub sweep_interval: Duration,
    /// Messages allowed per address per `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Lifetime of a positive name-ownership answer.
    pub name_ttl: Duration,
    pub session_ttl: Duration,
    pub registry_timeout: Duration,
    pub storage_timeout: Duration,
    /// Reject `/message` calls without a valid session token.
    pub require_session: bool,
    /// Domain every typed-data signature must be made under.
    pub domain: Eip712Domain,
    pub history_default_limit: usize,
    pub history_max_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            message_window: Duration::from_secs(5 * 60),
            auth_window: Duration::from_secs(2 * 60),
            nonce_ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            rate_limit: 30,
            rate_window: Duration::from_secs(60),
            name_ttl: Duration::from_secs(10 * 60),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            registry_timeout: Duration::from_secs(5),
            storage_timeout: Duration::from_secs(5),
            require_session: false,
            domain: Eip712Domain::default(),
            history_default_limit: 200,
            history_max_limit: 1000,
        }
    }
}

impl GatewayConfig {
    /// Shortest nonce TTL that still covers a message's whole freshness span.
    ///
    /// A timestamp is accepted from `message_window` in the past to
    /// `message_window` in the future, so a nonce must be remembered for at
    /// least twice the window or a replay could outlive it.
    pub fn min_nonce_ttl(&self) -> Duration {
        self.message_window * 2
    }

    /// Raise `nonce_ttl` to [`min_nonce_ttl`](Self::min_nonce_ttl) if it is shorter.
    pub fn validated(mut self) -> Self {
        let floor = self.min_nonce_ttl();
        if self.nonce_ttl < floor {
            warn!(
                configured = ?self.nonce_ttl,
                raised_to = ?floor,
                "nonce TTL shorter than the freshness span, raising it"
            );
            self.nonce_ttl = floor;
        }
        self
    }
}
