//! Level/repository entitlement graph.
//!
//! A level grants a repository iff `level.rank >= repository.minimum_rank`.
//! Each level also carries a materialized set of the repositories it grants,
//! kept equal to that rule by every mutator here:
//!
//! - adding a repository at threshold `t` attaches it to every level of rank `>= t`;
//! - adding a level at rank `r` inherits every repository with `minimum_rank <= r`;
//! - removing a repository detaches it from every level.
//!
//! Raising a rank never shrinks the accessible set. Access only disappears
//! through an explicit repository or level removal.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use url::Url;

use super::error::{Error, Result};
use super::model::{Level, Repository, RequesterId, User};
use super::store::PersistentStore;

#[derive(Default)]
struct Graph {
    levels: Vec<Level>,
    repositories: BTreeMap<String, Repository>,
}

impl Graph {
    fn level(&self, name: &str) -> Option<&Level> {
        self.levels.iter().find(|l| l.is_named(name))
    }

    fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories
            .values()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }
}

pub struct AccessModel {
    store: Arc<dyn PersistentStore>,
    graph: RwLock<Graph>,
}

static IDENTIFIER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,100}$").ok());

fn valid_identifier(value: &str) -> bool {
    IDENTIFIER_RE
        .as_ref()
        .is_some_and(|regex| regex.is_match(value))
}

fn check_rank(rank: i32) -> Result<()> {
    if rank < 0 {
        return Err(Error::InvalidInput(format!(
            "rank must be zero or positive, got {rank}"
        )));
    }
    Ok(())
}

impl AccessModel {
    /// Load levels and repositories from the durable store.
    ///
    /// # Errors
    /// Returns `Storage` if the store cannot be read.
    pub async fn load(store: Arc<dyn PersistentStore>) -> Result<Self> {
        let levels = store.get_levels().await?;
        let repositories = store
            .get_repositories()
            .await?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        let model = Self {
            store,
            graph: RwLock::new(Graph {
                levels,
                repositories,
            }),
        };
        {
            let graph = model.graph.read().await;
            info!(
                levels = graph.levels.len(),
                repositories = graph.repositories.len(),
                "access model loaded"
            );
        }
        Ok(model)
    }

    /// Repositories granted at `rank`, ordered by name.
    pub async fn repos_for_rank(&self, rank: i32) -> Vec<Repository> {
        self.graph
            .read()
            .await
            .repositories
            .values()
            .filter(|r| r.granted_by(rank))
            .cloned()
            .collect()
    }

    /// Entitlement of a known requester, resolved through their current rank.
    ///
    /// # Errors
    /// `NotFound` when the requester has no durable record.
    pub async fn repos_for(&self, requester: RequesterId) -> Result<Vec<Repository>> {
        let user = self
            .store
            .get_user(requester)
            .await?
            .ok_or_else(|| Error::not_found("user", requester.to_string()))?;
        Ok(self.repos_for_rank(user.access_level_rank).await)
    }

    /// The materialized repository set of a level.
    ///
    /// # Errors
    /// `NotFound` when no level has that name.
    pub async fn repos_for_level(&self, name: &str) -> Result<BTreeSet<String>> {
        self.graph
            .read()
            .await
            .level(name)
            .map(|l| l.repositories.clone())
            .ok_or_else(|| Error::not_found("level", name))
    }

    pub async fn levels(&self) -> Vec<Level> {
        let mut levels = self.graph.read().await.levels.clone();
        levels.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));
        levels
    }

    pub async fn repositories(&self) -> Vec<Repository> {
        self.graph
            .read()
            .await
            .repositories
            .values()
            .cloned()
            .collect()
    }

    /// Case-insensitive repository lookup.
    pub async fn repository(&self, name: &str) -> Option<Repository> {
        self.graph.read().await.repository(name).cloned()
    }

    /// # Errors
    /// `InvalidInput` for a malformed name, URL or rank; `DuplicateName` when
    /// a repository with that name exists; `Storage` on persistence failure.
    #[instrument(skip(self))]
    pub async fn add_repository(
        &self,
        name: &str,
        url: &str,
        owner: &str,
        minimum_rank: i32,
    ) -> Result<Repository> {
        if !valid_identifier(name) {
            return Err(Error::InvalidInput(format!("invalid repository name: {name}")));
        }
        if !valid_identifier(owner) {
            return Err(Error::InvalidInput(format!("invalid owner: {owner}")));
        }
        match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(Error::InvalidInput(format!("invalid repository URL: {url}"))),
        }
        check_rank(minimum_rank)?;

        let mut graph = self.graph.write().await;
        if graph.repository(name).is_some() {
            return Err(Error::duplicate("repository", name));
        }

        let repository = Repository {
            name: name.to_string(),
            url: url.to_string(),
            owner: owner.to_string(),
            minimum_rank,
        };
        self.store.upsert_repository(&repository).await?;

        // Persist every affected level before touching the in-memory graph.
        let mut updated = Vec::new();
        for level in graph.levels.iter().filter(|l| repository.granted_by(l.rank)) {
            let mut level = level.clone();
            level.repositories.insert(repository.name.clone());
            self.store.upsert_level(&level).await?;
            updated.push(level);
        }

        for level in updated {
            if let Some(slot) = graph.levels.iter_mut().find(|l| l.name == level.name) {
                *slot = level;
            }
        }
        graph
            .repositories
            .insert(repository.name.clone(), repository.clone());

        info!(
            repository = %repository.name,
            minimum_rank,
            "repository added"
        );
        Ok(repository)
    }

    /// # Errors
    /// `NotFound` when no repository has that name; `Storage` on persistence failure.
    #[instrument(skip(self))]
    pub async fn remove_repository(&self, name: &str) -> Result<Repository> {
        let mut graph = self.graph.write().await;
        let Some(repository) = graph.repository(name).cloned() else {
            info!(repository = name, "remove of unknown repository");
            return Err(Error::not_found("repository", name));
        };

        self.store.delete_repository(&repository.name).await?;

        graph.repositories.remove(&repository.name);
        for level in &mut graph.levels {
            level.repositories.remove(&repository.name);
        }

        info!(repository = %repository.name, "repository removed");
        Ok(repository)
    }

    /// # Errors
    /// `InvalidInput` for a malformed name or rank; `DuplicateName` when a
    /// level of that name exists (case-insensitive); `Storage` on persistence failure.
    #[instrument(skip(self))]
    pub async fn add_level(&self, name: &str, rank: i32) -> Result<Level> {
        if !valid_identifier(name) {
            return Err(Error::InvalidInput(format!("invalid level name: {name}")));
        }
        check_rank(rank)?;

        let mut graph = self.graph.write().await;
        if graph.level(name).is_some() {
            return Err(Error::duplicate("level", name));
        }

        let level = Level {
            name: name.to_string(),
            rank,
            repositories: graph
                .repositories
                .values()
                .filter(|r| r.granted_by(rank))
                .map(|r| r.name.clone())
                .collect(),
        };
        self.store.upsert_level(&level).await?;
        graph.levels.push(level.clone());

        info!(
            level = %level.name,
            rank,
            inherited = level.repositories.len(),
            "level added"
        );
        Ok(level)
    }

    /// # Errors
    /// `NotFound` when no level has that name; `Storage` on persistence failure.
    #[instrument(skip(self))]
    pub async fn remove_level(&self, name: &str) -> Result<Level> {
        let mut graph = self.graph.write().await;
        let Some(level) = graph.level(name).cloned() else {
            return Err(Error::not_found("level", name));
        };

        self.store.delete_level(&level.name).await?;
        graph.levels.retain(|l| l.name != level.name);

        info!(level = %level.name, "level removed");
        Ok(level)
    }

    /// Move a user to the rank of the named level.
    ///
    /// # Errors
    /// `NotFound` when the level or the user is unknown; `Storage` on
    /// persistence failure.
    #[instrument(skip(self))]
    pub async fn set_user_level(&self, requester: RequesterId, level_name: &str) -> Result<User> {
        let rank = self
            .graph
            .read()
            .await
            .level(level_name)
            .map(|l| l.rank)
            .ok_or_else(|| Error::not_found("level", level_name))?;

        let user = self
            .store
            .set_user_rank(requester, rank)
            .await?
            .ok_or_else(|| Error::not_found("user", requester.to_string()))?;

        info!(requester, level = level_name, rank, "user level changed");
        Ok(user)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gate::store::MemoryStore;

    async fn model() -> (Arc<MemoryStore>, AccessModel) {
        let store = Arc::new(MemoryStore::new());
        let model = AccessModel::load(store.clone()).await.unwrap();
        (store, model)
    }

    const URL: &str = "https://github.com/00-uno-00/lab1";

    #[tokio::test]
    async fn repository_attaches_to_levels_at_or_above_threshold() {
        let (store, model) = model().await;
        model.add_level("intro", 1).await.unwrap();
        model.add_level("zero", 0).await.unwrap();
        model.add_level("advanced", 3).await.unwrap();

        model.add_repository("lab1", URL, "org", 1).await.unwrap();

        assert!(model.repos_for_level("intro").await.unwrap().contains("lab1"));
        assert!(model.repos_for_level("advanced").await.unwrap().contains("lab1"));
        assert!(model.repos_for_level("zero").await.unwrap().is_empty());

        let persisted = store.get_level("intro").await.unwrap().unwrap();
        assert!(persisted.repositories.contains("lab1"));
    }

    #[tokio::test]
    async fn new_level_inherits_repositories_below_rank() {
        let (_store, model) = model().await;
        model.add_repository("lab1", URL, "org", 1).await.unwrap();
        model
            .add_repository("lab2", "https://github.com/org/lab2", "org", 2)
            .await
            .unwrap();

        let level = model.add_level("mid", 1).await.unwrap();
        assert_eq!(level.repositories, BTreeSet::from(["lab1".to_string()]));
    }

    #[tokio::test]
    async fn level_names_are_unique_case_insensitively() {
        let (_store, model) = model().await;
        model.add_level("Basic", 1).await.unwrap();
        let err = model.add_level("basic", 2).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "level", .. }));
    }

    #[tokio::test]
    async fn duplicate_repository_is_rejected() {
        let (_store, model) = model().await;
        model.add_repository("lab1", URL, "org", 0).await.unwrap();
        let err = model.add_repository("lab1", URL, "org", 0).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "repository", .. }));
    }

    #[tokio::test]
    async fn removing_unknown_entries_reports_not_found() {
        let (_store, model) = model().await;
        assert!(matches!(
            model.remove_repository("ghost").await.unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            model.remove_level("ghost").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected() {
        let (_store, model) = model().await;
        assert!(matches!(
            model.add_repository("lab 1", URL, "org", 0).await.unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            model.add_repository("lab1", "not a url", "org", 0).await.unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            model.add_level("neg", -1).await.unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn repos_for_rank_is_monotone() {
        let (_store, model) = model().await;
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let rank = i32::try_from(i).unwrap();
            model
                .add_repository(name, &format!("https://github.com/org/{name}"), "org", rank)
                .await
                .unwrap();
        }

        for low in 0..4 {
            for high in low..5 {
                let low_set = model.repos_for_rank(low).await;
                let high_set = model.repos_for_rank(high).await;
                assert!(low_set.iter().all(|r| high_set.contains(r)));
            }
        }
    }

    #[tokio::test]
    async fn set_user_level_moves_rank() {
        let (store, model) = model().await;
        model.add_level("advanced", 2).await.unwrap();
        store
            .upsert_user(&User::pending(42, "s@unito.it".into(), "octo".into(), None, 0))
            .await
            .unwrap();

        let user = model.set_user_level(42, "ADVANCED").await.unwrap();
        assert_eq!(user.access_level_rank, 2);
        assert!(matches!(
            model.set_user_level(42, "missing").await.unwrap_err(),
            Error::NotFound { kind: "level", .. }
        ));
        assert!(matches!(
            model.set_user_level(7, "advanced").await.unwrap_err(),
            Error::NotFound { kind: "user", .. }
        ));
    }

    #[tokio::test]
    async fn set_user_level_keeps_concurrent_profile_change() {
        let (store, model) = model().await;
        model.add_level("advanced", 2).await.unwrap();
        let mut user = User::pending(5, "old@unito.it".into(), "octo".into(), None, 0);
        user.verified = true;
        store.upsert_user(&user).await.unwrap();

        // The profile changes after the level change read its inputs.
        store
            .update_profile(5, "new@unito.it", "hubot", None)
            .await
            .unwrap();
        model.set_user_level(5, "advanced").await.unwrap();

        let stored = store.get_user(5).await.unwrap().unwrap();
        assert_eq!(stored.email, "new@unito.it");
        assert_eq!(stored.external_username, "hubot");
        assert_eq!(stored.access_level_rank, 2);
    }

    #[tokio::test]
    async fn repos_for_resolves_current_rank() {
        let (store, model) = model().await;
        model.add_level("basic", 1).await.unwrap();
        model.add_level("advanced", 2).await.unwrap();
        model.add_repository("lab1", URL, "org", 1).await.unwrap();
        model
            .add_repository("lab2", "https://github.com/org/lab2", "org", 2)
            .await
            .unwrap();
        store
            .upsert_user(&User::pending(8, "s@unito.it".into(), "octo".into(), None, 0))
            .await
            .unwrap();

        assert!(model.repos_for(8).await.unwrap().is_empty());

        model.set_user_level(8, "basic").await.unwrap();
        let names: Vec<String> = model
            .repos_for(8)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["lab1".to_string()]);

        model.set_user_level(8, "advanced").await.unwrap();
        assert_eq!(model.repos_for(8).await.unwrap().len(), 2);

        assert!(matches!(
            model.repos_for(404).await.unwrap_err(),
            Error::NotFound { kind: "user", .. }
        ));
    }

    #[tokio::test]
    async fn model_reloads_from_store() {
        let (store, model) = model().await;
        model.add_level("basic", 1).await.unwrap();
        model.add_repository("lab1", URL, "org", 1).await.unwrap();

        let reloaded = AccessModel::load(store).await.unwrap();
        assert_eq!(reloaded.repositories().await.len(), 1);
        assert!(reloaded.repos_for_level("basic").await.unwrap().contains("lab1"));
    }
}
