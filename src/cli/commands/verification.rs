use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use crate::gate::workflow::VerificationConfig;

pub const ARG_ALLOWED_DOMAINS: &str = "allowed-domains";
pub const ARG_CODE_TTL_SECONDS: &str = "code-ttl-seconds";
pub const ARG_VERIFICATION_POLL_SECONDS: &str = "verification-poll-seconds";
pub const ARG_DEFAULT_RANK: &str = "default-rank";
pub const ARG_ADMIN_IDS: &str = "admin-ids";

#[must_use]
pub fn parse(matches: &ArgMatches) -> VerificationConfig {
    let domains = matches
        .get_many::<String>(ARG_ALLOWED_DOMAINS)
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let admin_ids: Vec<i64> = matches
        .get_many::<i64>(ARG_ADMIN_IDS)
        .map(|values| values.copied().collect())
        .unwrap_or_default();

    VerificationConfig::new(domains)
        .with_code_ttl(Duration::from_secs(
            matches
                .get_one::<u64>(ARG_CODE_TTL_SECONDS)
                .copied()
                .unwrap_or(900),
        ))
        .with_poll_interval(Duration::from_secs(
            matches
                .get_one::<u64>(ARG_VERIFICATION_POLL_SECONDS)
                .copied()
                .unwrap_or(10),
        ))
        .with_default_rank(matches.get_one::<i32>(ARG_DEFAULT_RANK).copied().unwrap_or(0))
        .with_admin_ids(admin_ids)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ALLOWED_DOMAINS)
                .long(ARG_ALLOWED_DOMAINS)
                .help("Comma separated email domains accepted for verification")
                .env("REPOGATE_ALLOWED_DOMAINS")
                .value_delimiter(',')
                .default_values(["unito.it", "edu.unito.it"]),
        )
        .arg(
            Arg::new(ARG_CODE_TTL_SECONDS)
                .long(ARG_CODE_TTL_SECONDS)
                .help("Verification code lifetime in seconds")
                .env("REPOGATE_CODE_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_VERIFICATION_POLL_SECONDS)
                .long(ARG_VERIFICATION_POLL_SECONDS)
                .help("Interval at which a pending verification is checked")
                .env("REPOGATE_VERIFICATION_POLL_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_DEFAULT_RANK)
                .long(ARG_DEFAULT_RANK)
                .help("Rank given to newly verified users")
                .env("REPOGATE_DEFAULT_RANK")
                .default_value("0")
                .value_parser(clap::value_parser!(i32).range(0..)),
        )
        .arg(
            Arg::new(ARG_ADMIN_IDS)
                .long(ARG_ADMIN_IDS)
                .help("Comma separated Telegram user ids allowed to run /admin")
                .env("REPOGATE_ADMIN_IDS")
                .value_delimiter(',')
                .value_parser(clap::value_parser!(i64)),
        )
}
