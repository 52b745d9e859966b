use anyhow::Result;
use tracing::debug;

use crate::cli::commands::{github, telegram};
use crate::cli::telemetry;
use crate::gate::{self, mail::SmtpConfig, workflow::VerificationConfig};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub telegram: telegram::Options,
    pub github: github::Options,
    pub smtp: Option<SmtpConfig>,
    pub verification: VerificationConfig,
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if startup checks fail or the server stops with an error.
pub async fn execute(args: Args) -> Result<()> {
    debug!(
        port = args.port,
        webhook = args.telegram.webhook_url.is_some(),
        smtp = args.smtp.is_some(),
        "starting server"
    );

    let config = gate::Config {
        port: args.port,
        dsn: args.dsn,
        telegram: gate::TelegramSettings {
            token: args.telegram.token,
            api_url: args.telegram.api_url,
            webhook_url: args.telegram.webhook_url,
            webhook_secret: args.telegram.webhook_secret,
        },
        github: gate::GitHubSettings {
            token: args.github.token,
            api_url: args.github.api_url,
            org: args.github.org,
        },
        smtp: args.smtp,
        verification: args.verification,
    };

    let result = gate::new(config).await;
    telemetry::shutdown_tracer();
    result
}
