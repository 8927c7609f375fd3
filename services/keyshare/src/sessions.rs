//! In-memory console sessions.
//!
//! Sessions are keyed by the random cookie token. The store mutex only
//! covers the map; every session carries its own async mutex, which is the
//! barrier between a console handler and an attribute-disclosure callback
//! firing concurrently for the same session. A callback parks its error in
//! the session's pending slot, where the next `/checksession` picks it up.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::api::error::ApiError;

/// Cadence of the background session sweep.
pub const SESSION_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Mint an unguessable ASCII token (32 random bytes, base64 url-safe).
/// Shared by console sessions and the single-use email tokens.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug)]
pub struct SessionData {
    /// Authenticated account, `None` while anonymous or after logout.
    pub user_id: Option<i64>,
    pub expiry: Instant,
    /// Error parked by an asynchronous disclosure callback, held until
    /// `/checksession` consumes it or a later callback overwrites it.
    pub pending_error: Option<ApiError>,
}

#[derive(Debug)]
pub struct Session {
    token: String,
    state: Mutex<SessionData>,
}

impl Session {
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionData> {
        self.state.lock().await
    }
}

pub struct SessionStore {
    lifetime: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Mint an anonymous session and register it under a fresh token.
    pub async fn create(&self) -> Arc<Session> {
        let token = generate_token();
        let session = Arc::new(Session {
            token: token.clone(),
            state: Mutex::new(SessionData {
                user_id: None,
                expiry: Instant::now() + self.lifetime,
                pending_error: None,
            }),
        });
        self.sessions.lock().await.insert(token, Arc::clone(&session));
        session
    }

    /// Look up an unexpired session and extend its lifetime.
    pub async fn get(&self, token: &str) -> Option<Arc<Session>> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(token).cloned()
        }?;
        let mut data = session.lock().await;
        if data.expiry <= Instant::now() {
            return None;
        }
        data.expiry = Instant::now() + self.lifetime;
        drop(data);
        Some(session)
    }

    /// Drop expired sessions. Sessions currently locked by a handler are
    /// skipped; they are being used and will be extended anyway.
    pub async fn flush(&self) {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, session| match session.state.try_lock() {
            Ok(data) => data.expiry > now,
            Err(_) => true,
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!("flushed {removed} expired console sessions");
        }
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Spawn the periodic session sweep. The task never blocks request paths
/// and is aborted at shutdown.
pub fn spawn_sweeper(store: Arc<SessionStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(SESSION_FLUSH_INTERVAL).await;
            store.flush().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_are_unique_and_url_safe() {
        let store = SessionStore::new(Duration::from_secs(60));
        let first = store.create().await;
        let second = store.create().await;
        assert_ne!(first.token(), second.token());
        assert!(first.token().len() >= 40);
        assert!(first
            .token()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn get_returns_live_sessions_only() {
        let store = SessionStore::new(Duration::from_millis(100));
        let session = store.create().await;
        let token = session.token().to_string();

        assert!(store.get(&token).await.is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.get(&token).await.is_none());
        assert!(store.get("unknown").await.is_none());
    }

    #[tokio::test]
    async fn get_extends_expiry() {
        let store = SessionStore::new(Duration::from_millis(200));
        let session = store.create().await;
        let token = session.token().to_string();

        // Keep touching the session past its original lifetime.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            assert!(store.get(&token).await.is_some());
        }
    }

    #[tokio::test]
    async fn flush_removes_expired_sessions() {
        let store = SessionStore::new(Duration::from_millis(50));
        store.create().await;
        store.create().await;
        let live = SessionStore::new(Duration::from_secs(60));
        assert_eq!(store.len().await, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        store.flush().await;
        assert_eq!(store.len().await, 0);

        live.create().await;
        live.flush().await;
        assert_eq!(live.len().await, 1);
    }

    #[tokio::test]
    async fn pending_error_slot_holds_until_taken() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.create().await;
        {
            let mut data = session.lock().await;
            data.pending_error = Some(ApiError::InvalidProofs);
        }
        let mut data = session.lock().await;
        assert!(matches!(
            data.pending_error.take(),
            Some(ApiError::InvalidProofs)
        ));
        assert!(data.pending_error.is_none());
    }
}
