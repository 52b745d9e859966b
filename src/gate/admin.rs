//! `/admin` sub-commands. The caller is authorized before anything is parsed.

use std::fmt::Write as _;
use tracing::info;

use super::commands::{usage, Dispatcher, ADMIN_USAGE};
use super::error::{Error, Result};
use super::model::{BlockEntry, RequesterId};

fn parse_rank(value: &str) -> Result<i32> {
    value
        .parse::<i32>()
        .ok()
        .filter(|rank| *rank >= 0)
        .ok_or_else(|| Error::InvalidInput(format!("rank must be a non-negative integer: {value}")))
}

fn parse_requester(value: &str) -> Result<RequesterId> {
    value
        .parse::<RequesterId>()
        .map_err(|_| Error::InvalidInput(format!("not a requester id: {value}")))
}

impl Dispatcher {
    pub(super) async fn admin(&self, requester: RequesterId, args: &[String]) -> Result<String> {
        if !self.workflow.is_admin(requester).await? {
            return Err(Error::NotAdmin(requester));
        }

        let Some((sub, rest)) = args.split_first() else {
            return Ok(ADMIN_USAGE.to_string());
        };
        info!(requester, subcommand = %sub, "admin command");

        match (sub.to_ascii_lowercase().as_str(), rest) {
            ("addrepository", [name, url, rank, owner @ ..]) if owner.len() <= 1 => {
                let rank = parse_rank(rank)?;
                let owner = owner.first().unwrap_or(&self.default_owner);
                let repo = self.access.add_repository(name, url, owner, rank).await?;
                Ok(format!(
                    "Repository {} added for rank {} and above.",
                    repo.name, repo.minimum_rank
                ))
            }
            ("addrepository", _) => Err(usage(
                "/admin addrepository <name> <url> <min-rank> [owner]",
            )),

            ("removerepository", [name]) => {
                let repo = self.access.remove_repository(name).await?;
                Ok(format!("Repository {} removed.", repo.name))
            }
            ("removerepository", _) => Err(usage("/admin removerepository <name>")),

            ("addlevel", [name, rank]) => {
                let level = self.access.add_level(name, parse_rank(rank)?).await?;
                Ok(format!(
                    "Level {} (rank {}) added with {} repositories.",
                    level.name,
                    level.rank,
                    level.repositories.len()
                ))
            }
            ("addlevel", _) => Err(usage("/admin addlevel <name> <rank>")),

            ("removelevel", [name]) => {
                let level = self.access.remove_level(name).await?;
                Ok(format!("Level {} removed.", level.name))
            }
            ("removelevel", _) => Err(usage("/admin removelevel <name>")),

            ("setlevel", [target, level]) => {
                let user = self
                    .access
                    .set_user_level(parse_requester(target)?, level)
                    .await?;
                Ok(format!(
                    "User {} now has rank {}.",
                    user.requester_id, user.access_level_rank
                ))
            }
            ("setlevel", _) => Err(usage("/admin setlevel <requester-id> <level>")),

            ("addblacklist", [email, target @ ..]) if target.len() <= 1 => {
                let entry = BlockEntry {
                    email: email.trim().to_ascii_lowercase(),
                    requester_id: target.first().map(|id| parse_requester(id)).transpose()?,
                };
                let removed = self.workflow.block(&entry).await?;
                Ok(format!(
                    "{} block-listed; {removed} user record(s) removed.",
                    entry.email
                ))
            }
            ("addblacklist", _) => Err(usage("/admin addblacklist <email> [requester-id]")),

            ("delblacklist", [email]) => {
                let email = email.trim().to_ascii_lowercase();
                if !self.store.unblock(&email).await? {
                    return Err(Error::not_found("block-list entry", email));
                }
                Ok(format!("{email} removed from the block list."))
            }
            ("delblacklist", _) => Err(usage("/admin delblacklist <email>")),

            ("levels", []) => {
                let levels = self.access.levels().await;
                if levels.is_empty() {
                    return Ok("No levels defined.".to_string());
                }
                let mut text = "Levels:".to_string();
                for level in levels {
                    let repos: Vec<&str> = level.repositories.iter().map(String::as_str).collect();
                    let _ = write!(
                        text,
                        "\n- {} (rank {}): {}",
                        level.name,
                        level.rank,
                        if repos.is_empty() {
                            "-".to_string()
                        } else {
                            repos.join(", ")
                        }
                    );
                }
                Ok(text)
            }

            _ => Err(Error::InvalidInput(format!(
                "unknown admin command {sub}\n\n{ADMIN_USAGE}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_must_be_non_negative_integers() {
        assert_eq!(parse_rank("3").ok(), Some(3));
        assert!(parse_rank("-1").is_err());
        assert!(parse_rank("high").is_err());
    }

    #[test]
    fn requester_ids_are_integers() {
        assert_eq!(parse_requester("42").ok(), Some(42));
        assert!(parse_requester("@ada").is_err());
    }
}
