use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::gate::mail::SmtpConfig;

pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_USERNAME: &str = "smtp-username";
pub const ARG_SMTP_PASSWORD: &str = "smtp-password";
pub const ARG_MAIL_FROM: &str = "mail-from";

/// SMTP relay settings, or `None` when no host is configured.
///
/// # Errors
/// Returns an error if a host is given without the sender address.
pub fn parse(matches: &ArgMatches) -> anyhow::Result<Option<SmtpConfig>> {
    let get_non_empty = |id: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .filter(|v| !v.trim().is_empty())
    };

    let Some(host) = get_non_empty(ARG_SMTP_HOST) else {
        return Ok(None);
    };

    let from = get_non_empty(ARG_MAIL_FROM)
        .with_context(|| format!("missing required argument: --{ARG_MAIL_FROM}"))?;

    Ok(Some(SmtpConfig {
        host,
        port: matches.get_one::<u16>(ARG_SMTP_PORT).copied().unwrap_or(587),
        username: get_non_empty(ARG_SMTP_USERNAME).unwrap_or_default(),
        password: SecretString::from(get_non_empty(ARG_SMTP_PASSWORD).unwrap_or_default()),
        from,
    }))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay host; verification mail is only logged when unset")
                .env("REPOGATE_SMTP_HOST"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port (STARTTLS)")
                .env("REPOGATE_SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_USERNAME)
                .long(ARG_SMTP_USERNAME)
                .help("SMTP username")
                .env("REPOGATE_SMTP_USERNAME"),
        )
        .arg(
            Arg::new(ARG_SMTP_PASSWORD)
                .long(ARG_SMTP_PASSWORD)
                .help("SMTP password")
                .env("REPOGATE_SMTP_PASSWORD"),
        )
        .arg(
            Arg::new(ARG_MAIL_FROM)
                .long(ARG_MAIL_FROM)
                .help("Sender address of verification mail, example: Repogate <bot@unito.it>")
                .env("REPOGATE_MAIL_FROM"),
        )
}
