//! The repository access gate: verification, entitlement and the chat and
//! HTTP surfaces around them.

pub mod access;
pub mod admin;
pub mod chat;
pub mod codes;
pub mod commands;
pub mod error;
pub mod github;
pub mod handlers;
pub mod identity;
pub mod mail;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod telegram;
pub mod workflow;

mod openapi;

pub use error::{Error, ErrorClass, Result};
pub use openapi::openapi;

use anyhow::Context;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    response::{IntoResponse, Json},
    routing::{get, post},
    Extension, Router,
};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::{net::TcpListener, task::JoinHandle};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use self::access::AccessModel;
use self::chat::ChatTransport;
use self::commands::Dispatcher;
use self::github::{GitHubClient, HostingService};
use self::handlers::WebhookState;
use self::mail::{spawn_mail_worker, EmailSender, LogEmailSender, SmtpConfig, SmtpEmailSender};
use self::reconcile::AccessReconciler;
use self::store::{PersistentStore, PgStore};
use self::telegram::TelegramClient;
use self::workflow::{VerificationConfig, VerificationWorkflow};

pub const WEBHOOK_PATH: &str = "/v1/telegram/webhook";

#[derive(Debug)]
pub struct TelegramSettings {
    pub token: SecretString,
    pub api_url: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
}

#[derive(Debug)]
pub struct GitHubSettings {
    pub token: SecretString,
    pub api_url: String,
    pub org: String,
}

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub dsn: String,
    pub telegram: TelegramSettings,
    pub github: GitHubSettings,
    /// `None` logs outbound mail instead of sending it.
    pub smtp: Option<SmtpConfig>,
    pub verification: VerificationConfig,
}

/// The wired engine: every component shares one store and one chat transport.
pub struct Engine {
    pub dispatcher: Arc<Dispatcher>,
    pub workflow: Arc<VerificationWorkflow>,
    pub access: Arc<AccessModel>,
    pub mail_worker: JoinHandle<()>,
}

impl Engine {
    /// Load the access model and wire the components together.
    ///
    /// # Errors
    /// Returns an error if the access model cannot be loaded.
    pub async fn build(
        store: Arc<dyn PersistentStore>,
        chat: Arc<dyn ChatTransport>,
        hosting: Arc<dyn HostingService>,
        email: Arc<dyn EmailSender>,
        verification: VerificationConfig,
        default_owner: String,
    ) -> anyhow::Result<Self> {
        let access = Arc::new(
            AccessModel::load(Arc::clone(&store))
                .await
                .context("failed to load access model")?,
        );
        let (mailer, mail_worker) = spawn_mail_worker(email);
        let workflow = Arc::new(VerificationWorkflow::new(
            verification,
            Arc::clone(&store),
            mailer,
            Arc::clone(&chat),
        ));
        let reconciler = AccessReconciler::new(Arc::clone(&access), Arc::clone(&store), hosting);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&workflow),
            reconciler,
            Arc::clone(&access),
            store,
            chat,
            default_owner,
        ));

        Ok(Self {
            dispatcher,
            workflow,
            access,
            mail_worker,
        })
    }
}

/// Start the bot and its HTTP server.
///
/// # Errors
/// Returns an error if the database, the access model or the Telegram and
/// GitHub credentials cannot be set up, or if the server fails.
pub async fn new(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn PersistentStore> = Arc::new(PgStore::connect(&config.dsn).await?);

    let telegram = Arc::new(TelegramClient::new(
        &config.telegram.api_url,
        config.telegram.token,
    )?);
    let bot = telegram
        .get_me()
        .await
        .context("Telegram credential check failed")?;
    info!(bot = %bot, "Telegram credentials verified");

    let github = Arc::new(GitHubClient::new(
        &config.github.api_url,
        config.github.token,
    )?);
    let login = github.verify_credentials().await?;
    info!(login = %login, "GitHub credentials verified");

    let email: Arc<dyn EmailSender> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpEmailSender::new(smtp)?),
        None => Arc::new(LogEmailSender),
    };

    let engine = Engine::build(
        Arc::clone(&store),
        telegram.clone(),
        github,
        email,
        config.verification,
        config.github.org,
    )
    .await?;

    let mut app = Router::new()
        .route("/health", get(handlers::health).options(handlers::health))
        .route("/openapi.json", get(openapi_json));

    let polling = if let Some(webhook_url) = &config.telegram.webhook_url {
        telegram
            .set_webhook(webhook_url, config.telegram.webhook_secret.as_ref())
            .await?;
        let state = Arc::new(WebhookState {
            dispatcher: Arc::clone(&engine.dispatcher),
            secret: config.telegram.webhook_secret,
        });
        app = app
            .route(WEBHOOK_PATH, post(handlers::telegram_webhook))
            .layer(Extension(state));
        None
    } else {
        telegram.delete_webhook().await?;
        Some(tokio::spawn(telegram::run_polling(
            Arc::clone(&telegram),
            Arc::clone(&engine.dispatcher),
        )))
    };

    let app = app.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(store)),
    );

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    if let Some(polling) = polling {
        polling.abort();
    }
    engine.mail_worker.abort();

    Ok(())
}

async fn openapi_json() -> impl IntoResponse {
    Json(openapi())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
