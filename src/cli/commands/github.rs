use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::gate::github::DEFAULT_API_URL;

pub const ARG_GITHUB_TOKEN: &str = "github-token";
pub const ARG_GITHUB_API_URL: &str = "github-api-url";
pub const ARG_GITHUB_ORG: &str = "github-org";

pub const DEFAULT_ORG: &str = "00-uno-00";

#[derive(Debug)]
pub struct Options {
    pub token: SecretString,
    pub api_url: String,
    pub org: String,
}

impl Options {
    /// Parse GitHub arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the token is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let token = get_non_empty(ARG_GITHUB_TOKEN)
            .with_context(|| format!("missing required argument: --{ARG_GITHUB_TOKEN}"))?;

        Ok(Self {
            token: SecretString::from(token),
            api_url: get_non_empty(ARG_GITHUB_API_URL)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            org: get_non_empty(ARG_GITHUB_ORG).unwrap_or_else(|| DEFAULT_ORG.to_string()),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GITHUB_TOKEN)
                .long(ARG_GITHUB_TOKEN)
                .help("GitHub token allowed to manage collaborators")
                .env("REPOGATE_GITHUB_TOKEN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_GITHUB_API_URL)
                .long(ARG_GITHUB_API_URL)
                .help("GitHub REST API base URL")
                .env("REPOGATE_GITHUB_API_URL")
                .default_value(DEFAULT_API_URL),
        )
        .arg(
            Arg::new(ARG_GITHUB_ORG)
                .long(ARG_GITHUB_ORG)
                .help("Default owner of registered repositories")
                .env("REPOGATE_GITHUB_ORG")
                .default_value(DEFAULT_ORG),
        )
}
