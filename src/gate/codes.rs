//! One-time verification codes keyed by requester.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::model::RequesterId;

/// Random bytes per code; 9 bytes encode to exactly 12 base64 characters.
const CODE_BYTES: usize = 9;

/// Rendered length of every issued code.
pub const CODE_LENGTH: usize = 12;

/// A live code and its validity window.
#[derive(Clone, Debug)]
pub struct VerificationCode {
    pub owner: RequesterId,
    pub code: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl VerificationCode {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct CodeStore {
    ttl: Duration,
    codes: Mutex<HashMap<RequesterId, VerificationCode>>,
}

impl CodeStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            codes: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh code for `owner`, replacing any live one.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub async fn issue(&self, owner: RequesterId) -> Result<VerificationCode> {
        let code = generate_code()?;
        let now = Instant::now();
        let entry = VerificationCode {
            owner,
            code,
            issued_at: now,
            expires_at: now + self.ttl,
        };

        let mut codes = self.codes.lock().await;
        if codes.insert(owner, entry.clone()).is_some() {
            debug!(requester = owner, "previous verification code replaced");
        }
        Ok(entry)
    }

    /// Consume the live code for `owner` if `presented` matches it exactly.
    ///
    /// A mismatch leaves the live code in place; an expired code is purged.
    pub async fn consume(&self, owner: RequesterId, presented: &str) -> bool {
        let mut codes = self.codes.lock().await;
        let Some(entry) = codes.get(&owner) else {
            return false;
        };

        if entry.is_expired(Instant::now()) {
            codes.remove(&owner);
            return false;
        }

        if entry.code == presented {
            codes.remove(&owner);
            true
        } else {
            false
        }
    }

    /// Whether `owner` has a live, unexpired code.
    pub async fn is_pending(&self, owner: RequesterId) -> bool {
        let codes = self.codes.lock().await;
        codes
            .get(&owner)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Drop the code for `owner`; returns whether one existed.
    pub async fn invalidate(&self, owner: RequesterId) -> bool {
        self.codes.lock().await.remove(&owner).is_some()
    }

    /// Only invalidate when the live code is still `code`, so an expiring
    /// waiter never removes a code issued by a newer request.
    pub async fn invalidate_if(&self, owner: RequesterId, code: &str) -> bool {
        let mut codes = self.codes.lock().await;
        if codes.get(&owner).is_some_and(|entry| entry.code == code) {
            codes.remove(&owner);
            true
        } else {
            false
        }
    }
}

/// CSPRNG bytes rendered as URL-safe base64 without padding.
fn generate_code() -> Result<String> {
    let mut bytes = [0u8; CODE_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate verification code")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_have_fixed_length() {
        for _ in 0..64 {
            let code = generate_code().unwrap();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let store = CodeStore::new(Duration::from_secs(60));
        let issued = store.issue(42).await.unwrap();

        assert!(store.consume(42, &issued.code).await);
        assert!(!store.consume(42, &issued.code).await);
    }

    #[tokio::test]
    async fn wrong_code_keeps_live_code() {
        let store = CodeStore::new(Duration::from_secs(60));
        let issued = store.issue(42).await.unwrap();

        assert!(!store.consume(42, "AAAAAAAAAAAA").await);
        assert!(store.is_pending(42).await);
        assert!(store.consume(42, &issued.code).await);
    }

    #[tokio::test]
    async fn comparison_is_case_sensitive() {
        let store = CodeStore::new(Duration::from_secs(60));
        let issued = store.issue(1).await.unwrap();
        let flipped: String = issued
            .code
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            })
            .collect();

        if flipped != issued.code {
            assert!(!store.consume(1, &flipped).await);
        }
        assert!(store.consume(1, &issued.code).await);
    }

    #[tokio::test]
    async fn reissue_invalidates_previous_code() {
        let store = CodeStore::new(Duration::from_secs(60));
        let first = store.issue(7).await.unwrap();
        let second = store.issue(7).await.unwrap();

        if first.code != second.code {
            assert!(!store.consume(7, &first.code).await);
        }
        assert!(store.consume(7, &second.code).await);
    }

    #[tokio::test]
    async fn unknown_owner_is_not_an_error() {
        let store = CodeStore::new(Duration::from_secs(60));
        assert!(!store.consume(99, "whatever1234").await);
        assert!(!store.is_pending(99).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_code_is_rejected_and_purged() {
        let store = CodeStore::new(Duration::from_secs(30));
        let issued = store.issue(5).await.unwrap();
        let _other = store.issue(6).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!store.is_pending(5).await);
        assert!(!store.consume(5, &issued.code).await);
        let codes = store.codes.lock().await;
        assert!(!codes.contains_key(&5));
        assert!(codes.contains_key(&6));
    }

    #[tokio::test]
    async fn invalidate_if_ignores_newer_code() {
        let store = CodeStore::new(Duration::from_secs(60));
        let first = store.issue(3).await.unwrap();
        let second = store.issue(3).await.unwrap();

        if first.code != second.code {
            assert!(!store.invalidate_if(3, &first.code).await);
            assert!(store.is_pending(3).await);
        }
        assert!(store.invalidate_if(3, &second.code).await);
        assert!(!store.invalidate(3).await);
    }
}
