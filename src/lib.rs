//! # Repogate
//!
//! `repogate` is a Telegram bot that hands out read-only collaborator access
//! to GitHub repositories after the requester proves ownership of an
//! institutional email address.
//!
//! ## Verification
//!
//! `/verify <github-username> <email>` sends a single-use code to the email
//! address. Replying with the code within its lifetime marks the identity as
//! verified and stores it durably. Only addresses in the configured domains
//! are accepted.
//!
//! ## Levels and repositories
//!
//! Every user has a rank. A repository is registered with a minimum rank and
//! is granted to every level at or above it, so raising a rank never takes
//! access away. `/access <repository>` checks the entitlement and, when the
//! user is not yet a collaborator, sends a `pull` invitation.

pub mod cli;
pub mod gate;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
