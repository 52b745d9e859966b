use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::gate::telegram::DEFAULT_API_URL;

pub const ARG_TELEGRAM_TOKEN: &str = "telegram-token";
pub const ARG_TELEGRAM_API_URL: &str = "telegram-api-url";
pub const ARG_TELEGRAM_WEBHOOK_URL: &str = "telegram-webhook-url";
pub const ARG_TELEGRAM_WEBHOOK_SECRET: &str = "telegram-webhook-secret";

#[derive(Debug)]
pub struct Options {
    pub token: SecretString,
    pub api_url: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
}

impl Options {
    /// Parse Telegram arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the bot token is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let token = get_non_empty(ARG_TELEGRAM_TOKEN)
            .with_context(|| format!("missing required argument: --{ARG_TELEGRAM_TOKEN}"))?;

        Ok(Self {
            token: SecretString::from(token),
            api_url: get_non_empty(ARG_TELEGRAM_API_URL)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            webhook_url: get_non_empty(ARG_TELEGRAM_WEBHOOK_URL),
            webhook_secret: get_non_empty(ARG_TELEGRAM_WEBHOOK_SECRET).map(SecretString::from),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TELEGRAM_TOKEN)
                .long(ARG_TELEGRAM_TOKEN)
                .help("Telegram bot token")
                .env("REPOGATE_TELEGRAM_TOKEN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_TELEGRAM_API_URL)
                .long(ARG_TELEGRAM_API_URL)
                .help("Telegram Bot API base URL")
                .env("REPOGATE_TELEGRAM_API_URL")
                .default_value(DEFAULT_API_URL),
        )
        .arg(
            Arg::new(ARG_TELEGRAM_WEBHOOK_URL)
                .long(ARG_TELEGRAM_WEBHOOK_URL)
                .help("Public URL of the webhook endpoint; long polling is used when unset")
                .env("REPOGATE_TELEGRAM_WEBHOOK_URL"),
        )
        .arg(
            Arg::new(ARG_TELEGRAM_WEBHOOK_SECRET)
                .long(ARG_TELEGRAM_WEBHOOK_SECRET)
                .help("Secret token Telegram sends with every webhook call")
                .env("REPOGATE_TELEGRAM_WEBHOOK_SECRET")
                .requires(ARG_TELEGRAM_WEBHOOK_URL),
        )
}
