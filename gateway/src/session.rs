use std::time::Duration;

use dashmap::DashMap;
use hlchat_common::Address;
use tokio::time::Instant;

struct Session {
    address: Address,
    issued_at: Instant,
}

/// Opaque bearer tokens issued by the sign-in handshake.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Issue a new token for `address`.
    pub fn issue(&self, address: Address) -> String {
        let token = hex::encode(rand::random::<[u8; 32]>());
        self.sessions.insert(
            token.clone(),
            Session {
                address,
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// Address behind `token`, if the token exists and has not expired.
    pub fn validate(&self, token: &str) -> Option<Address> {
        {
            let session = self.sessions.get(token)?;
            if session.issued_at.elapsed() < self.ttl {
                return Some(session.address);
            }
        }
        // The shard guard must be released before removing.
        self.sessions.remove(token);
        None
    }

    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.issued_at.elapsed() < self.ttl);
        before.saturating_sub(self.sessions.len())
    }
}
