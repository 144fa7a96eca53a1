use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::domain::UserId;

/// Senders whose next non-command message is their API key.
///
/// State is per sender: a key typed by one user can never be recorded against another.
/// Entries expire after `ttl` so an abandoned registration does not capture chatter
/// days later.
#[derive(Debug)]
pub struct PendingRegistrations {
    ttl: Duration,
    inner: Mutex<HashMap<UserId, Instant>>,
}

impl PendingRegistrations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn is_live(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) <= self.ttl
    }

    /// Mark `user_id` as awaiting a key. Returns `false` if it already was.
    pub async fn begin(&self, user_id: UserId, now: Instant) -> bool {
        let mut map = self.inner.lock().await;
        if let Some(&since) = map.get(&user_id) {
            if self.is_live(since, now) {
                return false;
            }
        }
        map.insert(user_id, now);
        true
    }

    pub async fn is_pending(&self, user_id: UserId, now: Instant) -> bool {
        let map = self.inner.lock().await;
        map.get(&user_id)
            .is_some_and(|&since| self.is_live(since, now))
    }

    /// Clear the pending marker (key recorded, or activation rolled back).
    pub async fn complete(&self, user_id: UserId) {
        self.inner.lock().await.remove(&user_id);
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self, now: Instant) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, since| now.saturating_duration_since(*since) <= self.ttl);
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
