//! Durable storage of users, levels, repositories and the block list.
//!
//! `PgStore` is the production backend; `MemoryStore` keeps the same
//! semantics in process memory and backs the test suites.
//!
//! Shared semantics every backend honors:
//! - users are keyed by requester id and `upsert_user` never turns a verified
//!   record back into an unverified one;
//! - `set_user_rank` and `update_profile` change only their own columns in a
//!   single write, so concurrent edits of different fields never undo each
//!   other;
//! - level names are unique case-insensitively and `get_level`/`delete_level`
//!   match them that way;
//! - `upsert_level` replaces the level's materialized repository set;
//! - deleting a repository removes it from every level's set;
//! - `block` deletes every user matching the entry's email or requester id.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;

use super::model::{BlockEntry, Level, Repository, RequesterId, User};

#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Cheap liveness check used by the health endpoint.
    async fn ping(&self) -> Result<()>;

    async fn get_user(&self, requester: RequesterId) -> Result<Option<User>>;
    async fn upsert_user(&self, user: &User) -> Result<()>;
    async fn delete_user(&self, requester: RequesterId) -> Result<bool>;
    /// Returns the updated user, or `None` when there is no such user.
    async fn set_user_rank(&self, requester: RequesterId, rank: i32) -> Result<Option<User>>;
    /// Change email and username of a verified user; `handle` is kept when
    /// `None`. Returns `None` when there is no verified user.
    async fn update_profile(
        &self,
        requester: RequesterId,
        email: &str,
        username: &str,
        handle: Option<&str>,
    ) -> Result<Option<User>>;

    async fn get_levels(&self) -> Result<Vec<Level>>;
    async fn get_level(&self, name: &str) -> Result<Option<Level>>;
    async fn upsert_level(&self, level: &Level) -> Result<()>;
    async fn delete_level(&self, name: &str) -> Result<bool>;

    async fn get_repositories(&self) -> Result<Vec<Repository>>;
    async fn upsert_repository(&self, repository: &Repository) -> Result<()>;
    async fn delete_repository(&self, name: &str) -> Result<bool>;

    /// Add a block-list entry and delete matching users; returns the number
    /// of users removed.
    async fn block(&self, entry: &BlockEntry) -> Result<u64>;
    async fn unblock(&self, email: &str) -> Result<bool>;
    async fn is_blocked(&self, email: Option<&str>, requester: RequesterId) -> Result<bool>;
}
