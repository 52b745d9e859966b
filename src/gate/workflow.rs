//! Email verification handshake: `Unknown -> PendingVerification -> Verified`.
//!
//! A request caches a pending identity, issues a one-time code, queues the
//! mail and spawns a waiter. The waiter polls the identity cache until the
//! handshake completes, is superseded by a newer request, or the code
//! deadline passes. On expiry it drops the code and the cached identity and
//! tells the requester. A correct code flips the cached record to verified
//! and commits it to the durable store; the durable store is authoritative
//! from then on and the cache entry is evicted.

use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use super::chat::ChatTransport;
use super::codes::CodeStore;
use super::error::{Error, Result};
use super::identity::{IdentityStore, PendingIdentity};
use super::mail::{EmailMessage, Mailer};
use super::model::{BlockEntry, RequesterId, User};
use super::store::PersistentStore;

const DEFAULT_CODE_TTL_SECONDS: u64 = 15 * 60;
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

/// GitHub logins: alphanumerics and hyphens, at most 39 characters, not
/// starting with a hyphen.
static USERNAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,38}$").ok());

pub const EXPIRED_MESSAGE: &str =
    "Your verification code expired. Send /verify again to receive a new one.";

#[derive(Clone, Debug)]
pub struct VerificationConfig {
    allowed_domains: Vec<String>,
    code_ttl: Duration,
    poll_interval: Duration,
    default_rank: i32,
    admin_ids: HashSet<RequesterId>,
}

impl VerificationConfig {
    #[must_use]
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .into_iter()
                .map(|d| d.trim().trim_start_matches('@').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            code_ttl: Duration::from_secs(DEFAULT_CODE_TTL_SECONDS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            default_rank: 0,
            admin_ids: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_default_rank(mut self, rank: i32) -> Self {
        self.default_rank = rank;
        self
    }

    #[must_use]
    pub fn with_admin_ids(mut self, ids: impl IntoIterator<Item = RequesterId>) -> Self {
        self.admin_ids = ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    #[must_use]
    pub fn code_ttl(&self) -> Duration {
        self.code_ttl
    }

    #[must_use]
    pub fn default_rank(&self) -> i32 {
        self.default_rank
    }

    /// Email matches the basic address shape and ends in an allowed domain.
    fn email_allowed(&self, email: &str) -> bool {
        valid_email(email)
            && self
                .allowed_domains
                .iter()
                .any(|domain| email.ends_with(&format!("@{domain}")))
    }
}

fn valid_email(email_normalized: &str) -> bool {
    EMAIL_RE
        .as_ref()
        .is_some_and(|regex| regex.is_match(email_normalized))
}

fn valid_username(username: &str) -> bool {
    USERNAME_RE
        .as_ref()
        .is_some_and(|regex| regex.is_match(username))
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Where a requester stands in the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityState {
    Unknown,
    Pending { email: String, username: String },
    Verified(User),
}

/// A handshake that was started and is waiting for its code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingVerification {
    pub email: String,
    pub expires_in: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeOutcome {
    Verified(User),
    Invalid,
}

/// How a waiter finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The handshake completed (or its record was evicted) before the deadline.
    Completed,
    /// A newer request replaced this handshake.
    Superseded,
    /// The deadline passed; code and cached identity were dropped.
    Expired,
}

pub struct VerificationWorkflow {
    config: VerificationConfig,
    codes: Arc<CodeStore>,
    identities: Arc<IdentityStore>,
    /// Held while a code is issued and its identity cached, so both always
    /// belong to the same request.
    issuing: Mutex<()>,
    store: Arc<dyn PersistentStore>,
    mailer: Mailer,
    chat: Arc<dyn ChatTransport>,
}

impl VerificationWorkflow {
    #[must_use]
    pub fn new(
        config: VerificationConfig,
        store: Arc<dyn PersistentStore>,
        mailer: Mailer,
        chat: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            codes: Arc::new(CodeStore::new(config.code_ttl)),
            identities: Arc::new(IdentityStore::new()),
            issuing: Mutex::new(()),
            config,
            store,
            mailer,
            chat,
        }
    }

    #[must_use]
    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Whether the next plain message from `requester` is a code attempt.
    pub async fn has_pending_code(&self, requester: RequesterId) -> bool {
        self.codes.is_pending(requester).await
    }

    /// # Errors
    /// `Storage` if the durable store cannot be read.
    pub async fn is_admin(&self, requester: RequesterId) -> Result<bool> {
        if self.config.admin_ids.contains(&requester) {
            return Ok(true);
        }
        Ok(self
            .store
            .get_user(requester)
            .await?
            .is_some_and(|user| user.is_admin))
    }

    /// Durable record first; the cache only holds handshakes in flight.
    ///
    /// # Errors
    /// `Storage` if the durable store cannot be read.
    pub async fn state(&self, requester: RequesterId) -> Result<IdentityState> {
        if let Some(user) = self.store.get_user(requester).await? {
            if user.verified {
                return Ok(IdentityState::Verified(user));
            }
        }
        Ok(match self.identities.get(requester).await {
            Some(record) => IdentityState::Pending {
                email: record.user.email,
                username: record.user.external_username,
            },
            None => IdentityState::Unknown,
        })
    }

    /// Start (or restart) the handshake for `requester`.
    ///
    /// # Errors
    /// `InvalidInput` for a malformed username, `EmailDomain` for an email
    /// outside the allow-list, `Blocked` for a block-listed identity,
    /// `AlreadyVerified` when a durable verified record exists, `Upstream`
    /// when the mail queue is down, `Storage` on store failures.
    #[instrument(skip(self, handle))]
    pub async fn request_verification(
        &self,
        requester: RequesterId,
        handle: Option<String>,
        username: &str,
        email: &str,
    ) -> Result<PendingVerification> {
        if !valid_username(username) {
            return Err(Error::InvalidInput(format!(
                "not a valid GitHub username: {username}"
            )));
        }
        let email = normalize_email(email);
        if !self.config.email_allowed(&email) {
            return Err(Error::EmailDomain(email));
        }
        if self.store.is_blocked(Some(&email), requester).await? {
            return Err(Error::Blocked);
        }

        let existing = self.store.get_user(requester).await?;
        if let Some(user) = existing.as_ref().filter(|user| user.verified) {
            return Err(Error::AlreadyVerified {
                email: user.email.clone(),
                username: user.external_username.clone(),
            });
        }

        let rank = existing
            .as_ref()
            .map_or(self.config.default_rank, |user| user.access_level_rank);
        let mut user = User::pending(requester, email.clone(), username.to_string(), handle, rank);
        user.is_admin = self.config.admin_ids.contains(&requester)
            || existing.as_ref().is_some_and(|u| u.is_admin);

        let attempt = Ulid::new();
        let issued = {
            let _issuing = self.issuing.lock().await;
            let issued = self.codes.issue(requester).await?;
            self.identities
                .put(
                    requester,
                    PendingIdentity {
                        user,
                        attempt,
                        code: issued.code.clone(),
                        deadline: issued.expires_at,
                    },
                )
                .await;
            issued
        };

        let message = EmailMessage::verification(&email, &issued.code, self.config.code_ttl);
        if let Err(err) = self.mailer.queue(message) {
            self.codes.invalidate_if(requester, &issued.code).await;
            self.identities
                .remove_if(requester, |r| r.attempt == attempt)
                .await;
            return Err(Error::upstream("mail", format!("{err:#}")));
        }

        self.spawn_waiter(requester, attempt, issued.code, issued.expires_at);
        info!(requester, %attempt, "verification code issued");

        Ok(PendingVerification {
            email,
            expires_in: self.config.code_ttl,
        })
    }

    /// Check a presented code and commit the identity on a match.
    ///
    /// A wrong code leaves both the live code and the cached identity as
    /// they were. A code only commits the identity it was mailed for; if a
    /// newer request replaced that identity in the meantime the code is
    /// rejected.
    ///
    /// # Errors
    /// `NotFound` when the handshake expired between the code check and the
    /// commit, `Blocked` when the identity was block-listed while the code
    /// was out, `Storage` when the commit fails.
    #[instrument(skip(self, presented))]
    pub async fn submit_code(
        &self,
        requester: RequesterId,
        presented: &str,
    ) -> Result<CodeOutcome> {
        let presented = presented.trim();
        if !self.codes.consume(requester, presented).await {
            debug!(requester, "verification code rejected");
            return Ok(CodeOutcome::Invalid);
        }

        let record = self
            .identities
            .update(requester, |record| {
                (record.code == presented).then(|| {
                    record.user.verified = true;
                    record.clone()
                })
            })
            .await
            .ok_or_else(|| Error::not_found("pending verification", requester.to_string()))?;
        let Some(record) = record else {
            warn!(requester, "code does not belong to the cached handshake");
            return Ok(CodeOutcome::Invalid);
        };

        if self
            .store
            .is_blocked(Some(&record.user.email), requester)
            .await?
        {
            self.identities
                .remove_if(requester, |r| r.attempt == record.attempt)
                .await;
            return Err(Error::Blocked);
        }

        let committed = self.store.upsert_user(&record.user).await;
        self.identities
            .remove_if(requester, |r| r.attempt == record.attempt)
            .await;
        committed?;

        info!(requester, username = %record.user.external_username, "identity verified");
        Ok(CodeOutcome::Verified(record.user))
    }

    /// Change email and GitHub username of a verified identity.
    ///
    /// # Errors
    /// `NotVerified` when no verified durable record exists; otherwise the
    /// same validation errors as a verification request.
    #[instrument(skip(self, handle))]
    pub async fn update_profile(
        &self,
        requester: RequesterId,
        handle: Option<String>,
        username: &str,
        email: &str,
    ) -> Result<User> {
        if !self
            .store
            .get_user(requester)
            .await?
            .is_some_and(|user| user.verified)
        {
            return Err(Error::NotVerified);
        }

        if !valid_username(username) {
            return Err(Error::InvalidInput(format!(
                "not a valid GitHub username: {username}"
            )));
        }
        let email = normalize_email(email);
        if !self.config.email_allowed(&email) {
            return Err(Error::EmailDomain(email));
        }
        if self.store.is_blocked(Some(&email), requester).await? {
            return Err(Error::Blocked);
        }

        let user = self
            .store
            .update_profile(requester, &email, username, handle.as_deref())
            .await?
            .ok_or(Error::NotVerified)?;
        info!(requester, username = %user.external_username, "profile updated");
        Ok(user)
    }

    /// Block-list an identity: durable users go, and so does any handshake
    /// in flight for the same email or requester.
    ///
    /// # Errors
    /// `Storage` when the block list cannot be written.
    pub async fn block(&self, entry: &BlockEntry) -> Result<u64> {
        let removed = self.store.block(entry).await?;
        let evicted = self
            .identities
            .remove_where(|requester, record| {
                record.user.email.eq_ignore_ascii_case(&entry.email)
                    || entry.requester_id == Some(requester)
            })
            .await;
        for requester in &evicted {
            self.codes.invalidate(*requester).await;
        }
        info!(
            email = %entry.email,
            removed,
            handshakes = evicted.len(),
            "identity block-listed"
        );
        Ok(removed)
    }

    fn spawn_waiter(
        &self,
        requester: RequesterId,
        attempt: Ulid,
        code: String,
        deadline: Instant,
    ) -> JoinHandle<WaitOutcome> {
        let codes = Arc::clone(&self.codes);
        let identities = Arc::clone(&self.identities);
        let chat = Arc::clone(&self.chat);
        let poll_interval = self.config.poll_interval;

        tokio::spawn(async move {
            let watch = async {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match identities.get(requester).await {
                        None => return WaitOutcome::Completed,
                        Some(record) if record.attempt != attempt => return WaitOutcome::Superseded,
                        Some(record) if record.user.verified => return WaitOutcome::Completed,
                        Some(_) => {}
                    }
                }
            };

            let outcome = match timeout_at(deadline, watch).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let expired = identities
                        .remove_if(requester, |r| r.attempt == attempt && !r.user.verified)
                        .await;
                    if expired.is_none() {
                        WaitOutcome::Completed
                    } else {
                        codes.invalidate_if(requester, &code).await;
                        if let Err(err) = chat.send(requester, EXPIRED_MESSAGE).await {
                            warn!(requester, "failed to send expiry notice: {err:#}");
                        }
                        WaitOutcome::Expired
                    }
                }
            };
            debug!(requester, %attempt, ?outcome, "verification waiter finished");
            outcome
        })
    }
}
