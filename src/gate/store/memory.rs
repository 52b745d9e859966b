use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::PersistentStore;
use crate::gate::model::{BlockEntry, Level, Repository, RequesterId, User};

#[derive(Default)]
struct Inner {
    users: HashMap<RequesterId, User>,
    levels: Vec<Level>,
    repositories: BTreeMap<String, Repository>,
    blocklist: Vec<BlockEntry>,
}

/// In-process store with the same semantics as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_user(&self, requester: RequesterId) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&requester).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut user = user.clone();
        if let Some(existing) = inner.users.get(&user.requester_id) {
            user.verified |= existing.verified;
        }
        inner.users.insert(user.requester_id, user);
        Ok(())
    }

    async fn delete_user(&self, requester: RequesterId) -> Result<bool> {
        Ok(self.inner.lock().await.users.remove(&requester).is_some())
    }

    async fn set_user_rank(&self, requester: RequesterId, rank: i32) -> Result<Option<User>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.users.get_mut(&requester).map(|user| {
            user.access_level_rank = rank;
            user.clone()
        }))
    }

    async fn update_profile(
        &self,
        requester: RequesterId,
        email: &str,
        username: &str,
        handle: Option<&str>,
    ) -> Result<Option<User>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .users
            .get_mut(&requester)
            .filter(|user| user.verified)
            .map(|user| {
                user.email = email.to_string();
                user.external_username = username.to_string();
                if let Some(handle) = handle {
                    user.display_handle = Some(handle.to_string());
                }
                user.clone()
            }))
    }

    async fn get_levels(&self) -> Result<Vec<Level>> {
        let mut levels = self.inner.lock().await.levels.clone();
        levels.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));
        Ok(levels)
    }

    async fn get_level(&self, name: &str) -> Result<Option<Level>> {
        let inner = self.inner.lock().await;
        Ok(inner.levels.iter().find(|l| l.is_named(name)).cloned())
    }

    async fn upsert_level(&self, level: &Level) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut level = level.clone();
        let known = &inner.repositories;
        level.repositories.retain(|name| known.contains_key(name));
        if let Some(existing) = inner.levels.iter_mut().find(|l| l.is_named(&level.name)) {
            *existing = level;
        } else {
            inner.levels.push(level);
        }
        Ok(())
    }

    async fn delete_level(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.levels.len();
        inner.levels.retain(|l| !l.is_named(name));
        Ok(inner.levels.len() != before)
    }

    async fn get_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self
            .inner
            .lock()
            .await
            .repositories
            .values()
            .cloned()
            .collect())
    }

    async fn upsert_repository(&self, repository: &Repository) -> Result<()> {
        self.inner
            .lock()
            .await
            .repositories
            .insert(repository.name.clone(), repository.clone());
        Ok(())
    }

    async fn delete_repository(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let removed = inner.repositories.remove(name).is_some();
        for level in &mut inner.levels {
            level.repositories.remove(name);
        }
        Ok(removed)
    }

    async fn block(&self, entry: &BlockEntry) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner
            .blocklist
            .retain(|e| !e.email.eq_ignore_ascii_case(&entry.email));
        inner.blocklist.push(entry.clone());

        let before = inner.users.len();
        inner.users.retain(|id, user| {
            !(user.email.eq_ignore_ascii_case(&entry.email) || Some(*id) == entry.requester_id)
        });
        Ok((before - inner.users.len()) as u64)
    }

    async fn unblock(&self, email: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.blocklist.len();
        inner
            .blocklist
            .retain(|e| !e.email.eq_ignore_ascii_case(email));
        Ok(inner.blocklist.len() != before)
    }

    async fn is_blocked(&self, email: Option<&str>, requester: RequesterId) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.blocklist.iter().any(|e| {
            e.requester_id == Some(requester)
                || email.is_some_and(|email| e.email.eq_ignore_ascii_case(email))
        }))
    }
}
