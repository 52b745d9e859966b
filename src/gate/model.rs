//! Records shared by the engine, the durable store, and the adapters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable identity assigned by the chat transport.
pub type RequesterId = i64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub requester_id: RequesterId,
    pub email: String,
    /// GitHub login.
    pub external_username: String,
    /// Telegram username, when the requester has one.
    pub display_handle: Option<String>,
    pub verified: bool,
    pub is_admin: bool,
    pub access_level_rank: i32,
}

impl User {
    /// A fresh, unverified record as created by a verification request.
    #[must_use]
    pub fn pending(
        requester_id: RequesterId,
        email: String,
        external_username: String,
        display_handle: Option<String>,
        access_level_rank: i32,
    ) -> Self {
        Self {
            requester_id,
            email,
            external_username,
            display_handle,
            verified: false,
            is_admin: false,
            access_level_rank,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub name: String,
    pub rank: i32,
    /// Materialized set of repository names this level grants.
    pub repositories: BTreeSet<String>,
}

impl Level {
    /// Case-insensitive name comparison.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    pub owner: String,
    pub minimum_rank: i32,
}

impl Repository {
    #[must_use]
    pub fn granted_by(&self, rank: i32) -> bool {
        rank >= self.minimum_rank
    }
}

/// Block-listed identity; either field is enough to reject a requester.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub email: String,
    pub requester_id: Option<RequesterId>,
}

/// Collaborator permission on the hosting service. Only `Pull` is ever granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Pull,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
        }
    }
}
