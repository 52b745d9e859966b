//! Telegram Bot API adapter: long polling, webhook registration and replies.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use url::Url;
use utoipa::ToSchema;

use super::chat::{ChatTransport, Inbound};
use super::commands::Dispatcher;
use super::model::RequesterId;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Header carrying the secret registered with `setWebhook`.
pub const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub username: Option<String>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Update {
    /// Text messages from humans in private chats; everything else is dropped.
    #[must_use]
    pub fn into_inbound(self) -> Option<Inbound> {
        let message = self.message?;
        let from = message.from?;
        if from.is_bot || message.chat.kind != "private" {
            return None;
        }
        let text = message.text?;
        Some(Inbound::parse(from.id, from.username, &text))
    }
}

pub struct TelegramClient {
    client: Client,
    api_url: Url,
    token: SecretString,
}

impl TelegramClient {
    /// # Errors
    /// Returns an error if the API URL is invalid or the HTTP client cannot be built.
    pub fn new(api_url: &str, token: SecretString) -> Result<Self> {
        let api_url =
            Url::parse(api_url).with_context(|| format!("invalid Telegram API URL: {api_url}"))?;
        if api_url.cannot_be_a_base() {
            return Err(anyhow!("Telegram API URL cannot be a base: {api_url}"));
        }
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            api_url,
            token,
        })
    }

    fn method_url(&self, method: &str) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("Telegram API URL cannot be a base"))?
            .pop_if_empty()
            .push(&format!("bot{}", self.token.expose_secret()))
            .push(method);
        Ok(url)
    }

    /// POST a Bot API method. The URL embeds the token, so transport errors
    /// are stripped of it before being reported.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let mut request = self.client.post(self.method_url(method)?).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Telegram {method} request failed"))?;

        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("invalid Telegram {method} response"))?;

        if !body.ok {
            return Err(anyhow!(
                "Telegram {method} failed: {} {}",
                body.error_code.unwrap_or_default(),
                body.description.unwrap_or_default()
            ));
        }
        body.result
            .ok_or_else(|| anyhow!("Telegram {method} returned no result"))
    }

    /// Check the token; returns the bot username.
    ///
    /// # Errors
    /// Returns an error if Telegram rejects the token or is unreachable.
    pub async fn get_me(&self) -> Result<String> {
        let me: TelegramUser = self.call("getMe", &json!({}), None).await?;
        Ok(me.username.unwrap_or_default())
    }

    /// # Errors
    /// Returns an error on transport or API failure.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT.as_secs(),
                "allowed_updates": ["message"],
            }),
            Some(POLL_TIMEOUT + REQUEST_TIMEOUT),
        )
        .await
    }

    /// # Errors
    /// Returns an error on transport or API failure.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let _sent: Value = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                    "disable_web_page_preview": true,
                }),
                None,
            )
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if Telegram refuses the webhook.
    #[instrument(skip(self, secret))]
    pub async fn set_webhook(&self, url: &str, secret: Option<&SecretString>) -> Result<()> {
        let mut body = json!({ "url": url, "allowed_updates": ["message"] });
        if let Some(secret) = secret {
            body["secret_token"] = json!(secret.expose_secret());
        }
        let _registered: bool = self.call("setWebhook", &body, None).await?;
        info!("Telegram webhook registered");
        Ok(())
    }

    /// Polling and webhooks are mutually exclusive on the Bot API.
    ///
    /// # Errors
    /// Returns an error on transport or API failure.
    pub async fn delete_webhook(&self) -> Result<()> {
        let _deleted: bool = self.call("deleteWebhook", &json!({}), None).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send(&self, requester: RequesterId, text: &str) -> Result<()> {
        // Private chat ids equal the user id.
        self.send_message(requester, text).await
    }
}

/// Long-poll `getUpdates` forever, handing each message to its own task.
pub async fn run_polling(client: Arc<TelegramClient>, dispatcher: Arc<Dispatcher>) {
    let mut offset = 0;
    info!("Telegram long polling started");
    loop {
        match client.get_updates(offset).await {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if let Some(inbound) = update.into_inbound() {
                        tokio::spawn(Arc::clone(&dispatcher).handle(inbound));
                    }
                }
            }
            Err(err) => {
                error!("Telegram polling failed: {err:#}");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
        }
        debug!(offset, "poll cycle done");
    }
}
