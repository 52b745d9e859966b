//! Bring hosting-service collaborator state in line with entitlement.

use std::sync::Arc;
use tracing::{info, instrument};

use super::access::AccessModel;
use super::error::{Error, Result};
use super::github::{AddCollaborator, HostingService};
use super::model::{Permission, Repository, RequesterId, User};
use super::store::PersistentStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    AlreadyGranted(Repository),
    InviteSent(Repository),
}

pub struct AccessReconciler {
    access: Arc<AccessModel>,
    store: Arc<dyn PersistentStore>,
    hosting: Arc<dyn HostingService>,
}

impl AccessReconciler {
    #[must_use]
    pub fn new(
        access: Arc<AccessModel>,
        store: Arc<dyn PersistentStore>,
        hosting: Arc<dyn HostingService>,
    ) -> Self {
        Self {
            access,
            store,
            hosting,
        }
    }

    async fn verified_user(&self, requester: RequesterId) -> Result<User> {
        self.store
            .get_user(requester)
            .await?
            .filter(|user| user.verified)
            .ok_or(Error::NotVerified)
    }

    /// Repositories the requester's rank grants.
    ///
    /// # Errors
    /// `NotVerified` without a verified durable record.
    pub async fn entitlement(&self, requester: RequesterId) -> Result<Vec<Repository>> {
        let user = self.verified_user(requester).await?;
        Ok(self.access.repos_for_rank(user.access_level_rank).await)
    }

    /// Make `requester` a `pull` collaborator of `repository`.
    ///
    /// Entitlement is checked before any hosting-service call. No retry on
    /// upstream failure.
    ///
    /// # Errors
    /// `NotVerified`, `NotEntitled` (also for unknown repositories),
    /// `Upstream` from the hosting service, `Storage`.
    #[instrument(skip(self))]
    pub async fn ensure(&self, requester: RequesterId, repository: &str) -> Result<GrantOutcome> {
        let user = self.verified_user(requester).await?;
        let repo = self
            .access
            .repository(repository)
            .await
            .filter(|repo| repo.granted_by(user.access_level_rank))
            .ok_or_else(|| Error::NotEntitled(repository.to_string()))?;

        let username = &user.external_username;
        if self
            .hosting
            .is_collaborator(&repo.owner, &repo.name, username)
            .await?
        {
            return Ok(GrantOutcome::AlreadyGranted(repo));
        }

        match self
            .hosting
            .add_collaborator(&repo.owner, &repo.name, username, Permission::Pull)
            .await?
        {
            AddCollaborator::Invited => {
                info!(
                    requester,
                    repository = %repo.name,
                    username = %username,
                    "collaborator invite sent"
                );
                Ok(GrantOutcome::InviteSent(repo))
            }
            AddCollaborator::AlreadyCollaborator => Ok(GrantOutcome::AlreadyGranted(repo)),
        }
    }

    /// Entitled repositories on which the requester is a collaborator now.
    ///
    /// # Errors
    /// `NotVerified`, or `Upstream` if any collaborator check fails.
    pub async fn accessible_repositories(&self, requester: RequesterId) -> Result<Vec<Repository>> {
        let user = self.verified_user(requester).await?;
        let mut accessible = Vec::new();
        for repo in self.access.repos_for_rank(user.access_level_rank).await {
            if self
                .hosting
                .is_collaborator(&repo.owner, &repo.name, &user.external_username)
                .await?
            {
                accessible.push(repo);
            }
        }
        Ok(accessible)
    }
}
