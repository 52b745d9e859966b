use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Connection, PgPool, Row,
};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{info_span, Instrument, Span};

use super::PersistentStore;
use crate::gate::model::{BlockEntry, Level, Repository, RequesterId, User};

const SCHEMA_SQL: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/db/sql/01_repogate.sql"
));

fn query_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn user_from_row(row: &PgRow) -> User {
    User {
        requester_id: row.get("requester_id"),
        email: row.get("email"),
        external_username: row.get("external_username"),
        display_handle: row.get("display_handle"),
        verified: row.get("verified"),
        is_admin: row.get("is_admin"),
        access_level_rank: row.get("access_level_rank"),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and make sure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the connection or the schema bootstrap fails.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await
            .context("failed to connect to database")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the idempotent schema script.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .instrument(query_span("CREATE", "01_repogate.sql"))
            .await
            .context("failed to apply database schema")?;
        Ok(())
    }

    async fn level_repositories(&self) -> Result<HashMap<String, BTreeSet<String>>> {
        let query = "SELECT level_name, repository_name FROM level_repositories";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load level repositories")?;

        let mut sets: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            sets.entry(row.get("level_name"))
                .or_default()
                .insert(row.get("repository_name"));
        }
        Ok(sets)
    }
}

#[async_trait]
impl PersistentStore for PgStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .instrument(info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            ))
            .await
            .context("failed to acquire database connection")?;
        conn.ping()
            .instrument(info_span!(
                "db.ping",
                db.system = "postgresql",
                db.operation = "PING"
            ))
            .await
            .context("failed to ping database")
    }

    async fn get_user(&self, requester: RequesterId) -> Result<Option<User>> {
        let query = r"
            SELECT requester_id, email, external_username, display_handle,
                   verified, is_admin, access_level_rank
            FROM users
            WHERE requester_id = $1
        ";
        let row = sqlx::query(query)
            .bind(requester)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup user")?;

        Ok(row.as_ref().map(user_from_row))
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        // `verified` is OR-ed so an update can never reset it.
        let query = r"
            INSERT INTO users
                (requester_id, email, external_username, display_handle,
                 verified, is_admin, access_level_rank)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (requester_id) DO UPDATE
            SET email = EXCLUDED.email,
                external_username = EXCLUDED.external_username,
                display_handle = EXCLUDED.display_handle,
                verified = users.verified OR EXCLUDED.verified,
                is_admin = EXCLUDED.is_admin,
                access_level_rank = EXCLUDED.access_level_rank,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(user.requester_id)
            .bind(&user.email)
            .bind(&user.external_username)
            .bind(user.display_handle.as_deref())
            .bind(user.verified)
            .bind(user.is_admin)
            .bind(user.access_level_rank)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert user")?;
        Ok(())
    }

    async fn set_user_rank(&self, requester: RequesterId, rank: i32) -> Result<Option<User>> {
        let query = r"
            UPDATE users
            SET access_level_rank = $2, updated_at = NOW()
            WHERE requester_id = $1
            RETURNING requester_id, email, external_username, display_handle,
                      verified, is_admin, access_level_rank
        ";
        let row = sqlx::query(query)
            .bind(requester)
            .bind(rank)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to set user rank")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn update_profile(
        &self,
        requester: RequesterId,
        email: &str,
        username: &str,
        handle: Option<&str>,
    ) -> Result<Option<User>> {
        let query = r"
            UPDATE users
            SET email = $2,
                external_username = $3,
                display_handle = COALESCE($4, display_handle),
                updated_at = NOW()
            WHERE requester_id = $1 AND verified
            RETURNING requester_id, email, external_username, display_handle,
                      verified, is_admin, access_level_rank
        ";
        let row = sqlx::query(query)
            .bind(requester)
            .bind(email)
            .bind(username)
            .bind(handle)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update user profile")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn delete_user(&self, requester: RequesterId) -> Result<bool> {
        let query = "DELETE FROM users WHERE requester_id = $1";
        let result = sqlx::query(query)
            .bind(requester)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete user")?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_levels(&self) -> Result<Vec<Level>> {
        let query = "SELECT name, rank FROM levels ORDER BY rank ASC, name ASC";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load levels")?;

        let mut sets = self.level_repositories().await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("name");
                let repositories = sets.remove(&name).unwrap_or_default();
                Level {
                    name,
                    rank: row.get("rank"),
                    repositories,
                }
            })
            .collect())
    }

    async fn get_level(&self, name: &str) -> Result<Option<Level>> {
        let query = "SELECT name, rank FROM levels WHERE lower(name) = lower($1)";
        let row = sqlx::query(query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup level")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let name: String = row.get("name");

        let query = "SELECT repository_name FROM level_repositories WHERE level_name = $1";
        let repositories = sqlx::query(query)
            .bind(&name)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load level repositories")?
            .into_iter()
            .map(|row| row.get("repository_name"))
            .collect();

        Ok(Some(Level {
            name,
            rank: row.get("rank"),
            repositories,
        }))
    }

    async fn upsert_level(&self, level: &Level) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin level transaction")?;

        let query = r"
            INSERT INTO levels (name, rank)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET rank = EXCLUDED.rank
        ";
        sqlx::query(query)
            .bind(&level.name)
            .bind(level.rank)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert level")?;

        let query = "DELETE FROM level_repositories WHERE level_name = $1";
        sqlx::query(query)
            .bind(&level.name)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to reset level repositories")?;

        let repositories: Vec<String> = level.repositories.iter().cloned().collect();
        let query = r"
            INSERT INTO level_repositories (level_name, repository_name)
            SELECT $1, r.name
            FROM repositories r
            WHERE r.name = ANY($2)
        ";
        sqlx::query(query)
            .bind(&level.name)
            .bind(&repositories)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to store level repositories")?;

        tx.commit().await.context("commit level transaction")?;
        Ok(())
    }

    async fn delete_level(&self, name: &str) -> Result<bool> {
        let query = "DELETE FROM levels WHERE lower(name) = lower($1)";
        let result = sqlx::query(query)
            .bind(name)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete level")?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_repositories(&self) -> Result<Vec<Repository>> {
        let query = "SELECT name, url, owner, minimum_rank FROM repositories ORDER BY name ASC";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load repositories")?;

        Ok(rows
            .into_iter()
            .map(|row| Repository {
                name: row.get("name"),
                url: row.get("url"),
                owner: row.get("owner"),
                minimum_rank: row.get("minimum_rank"),
            })
            .collect())
    }

    async fn upsert_repository(&self, repository: &Repository) -> Result<()> {
        let query = r"
            INSERT INTO repositories (name, url, owner, minimum_rank)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET url = EXCLUDED.url,
                owner = EXCLUDED.owner,
                minimum_rank = EXCLUDED.minimum_rank
        ";
        sqlx::query(query)
            .bind(&repository.name)
            .bind(&repository.url)
            .bind(&repository.owner)
            .bind(repository.minimum_rank)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert repository")?;
        Ok(())
    }

    async fn delete_repository(&self, name: &str) -> Result<bool> {
        // level_repositories rows go with it through ON DELETE CASCADE.
        let query = "DELETE FROM repositories WHERE name = $1";
        let result = sqlx::query(query)
            .bind(name)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete repository")?;
        Ok(result.rows_affected() > 0)
    }

    async fn block(&self, entry: &BlockEntry) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin block transaction")?;

        let query = r"
            INSERT INTO blocklist (email, requester_id)
            VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE SET requester_id = EXCLUDED.requester_id
        ";
        sqlx::query(query)
            .bind(&entry.email)
            .bind(entry.requester_id)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert block-list entry")?;

        let query = r"
            DELETE FROM users
            WHERE lower(email) = lower($1)
               OR ($2::BIGINT IS NOT NULL AND requester_id = $2)
        ";
        let result = sqlx::query(query)
            .bind(&entry.email)
            .bind(entry.requester_id)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete block-listed users")?;

        tx.commit().await.context("commit block transaction")?;
        Ok(result.rows_affected())
    }

    async fn unblock(&self, email: &str) -> Result<bool> {
        let query = "DELETE FROM blocklist WHERE lower(email) = lower($1)";
        let result = sqlx::query(query)
            .bind(email)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete block-list entry")?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_blocked(&self, email: Option<&str>, requester: RequesterId) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM blocklist
                WHERE requester_id = $2
                   OR ($1::TEXT IS NOT NULL AND lower(email) = lower($1))
            ) AS blocked
        ";
        let row = sqlx::query(query)
            .bind(email)
            .bind(requester)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to check block list")?;
        Ok(row.get("blocked"))
    }
}
