//! Map parsed CLI arguments to the action the binary runs.

use anyhow::{Context, Result};

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{github, smtp, telegram, verification, ARG_DSN, ARG_PORT};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        telegram: telegram::Options::parse(matches)?,
        github: github::Options::parse(matches)?,
        smtp: smtp::parse(matches)?,
        verification: verification::parse(matches),
    }))
}
