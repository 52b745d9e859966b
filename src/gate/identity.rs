//! Working identity records held during the verification handshake.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;
use ulid::Ulid;

use super::model::{RequesterId, User};

/// Cached, not-yet-committed identity for one handshake.
#[derive(Clone, Debug)]
pub struct PendingIdentity {
    pub user: User,
    /// Identifies the handshake; a re-request gets a new attempt id.
    pub attempt: Ulid,
    /// The code mailed for this handshake. Only this code can commit `user`.
    pub code: String,
    pub deadline: Instant,
}

#[derive(Default)]
pub struct IdentityStore {
    records: Mutex<HashMap<RequesterId, PendingIdentity>>,
}

impl IdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, requester: RequesterId, record: PendingIdentity) {
        let attempt = record.attempt;
        let replaced = self
            .records
            .lock()
            .await
            .insert(requester, record)
            .is_some();
        info!(requester, %attempt, replaced, "identity cache put");
    }

    pub async fn get(&self, requester: RequesterId) -> Option<PendingIdentity> {
        self.records.lock().await.get(&requester).cloned()
    }

    /// Remove every record matching `predicate`; returns the evicted requesters.
    pub async fn remove_where<F>(&self, predicate: F) -> Vec<RequesterId>
    where
        F: Fn(RequesterId, &PendingIdentity) -> bool,
    {
        let mut records = self.records.lock().await;
        let evicted: Vec<RequesterId> = records
            .iter()
            .filter(|(requester, record)| predicate(**requester, record))
            .map(|(requester, _)| *requester)
            .collect();
        for requester in &evicted {
            records.remove(requester);
            info!(requester, "identity cache evict");
        }
        evicted
    }

    /// Remove and return the record when `predicate` holds for it, under a
    /// single lock acquisition.
    pub async fn remove_if<F>(
        &self,
        requester: RequesterId,
        predicate: F,
    ) -> Option<PendingIdentity>
    where
        F: FnOnce(&PendingIdentity) -> bool,
    {
        let mut records = self.records.lock().await;
        if !records.get(&requester).is_some_and(predicate) {
            return None;
        }
        let removed = records.remove(&requester);
        if let Some(record) = &removed {
            info!(requester, attempt = %record.attempt, "identity cache evict");
        }
        removed
    }

    /// Read-mutate-write under a single lock acquisition.
    ///
    /// Returns `None` when no record exists for `requester`.
    pub async fn update<F, R>(&self, requester: RequesterId, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut PendingIdentity) -> R,
    {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&requester)?;
        let result = mutate(record);
        info!(
            requester,
            attempt = %record.attempt,
            verified = record.user.verified,
            "identity cache update"
        );
        Some(result)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}
