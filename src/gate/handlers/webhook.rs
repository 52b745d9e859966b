use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::gate::commands::Dispatcher;
use crate::gate::telegram::{Update, SECRET_TOKEN_HEADER};

pub struct WebhookState {
    pub dispatcher: Arc<Dispatcher>,
    pub secret: Option<SecretString>,
}

fn secret_matches(secret: Option<&SecretString>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|presented| presented == secret.expose_secret())
}

#[utoipa::path(
    post,
    path = "/v1/telegram/webhook",
    request_body = Update,
    responses (
        (status = 200, description = "Update accepted"),
        (status = 401, description = "Missing or wrong secret token header")
    ),
    tag = "telegram"
)]
// axum handler for Telegram webhook deliveries
pub async fn telegram_webhook(
    headers: HeaderMap,
    state: Extension<Arc<WebhookState>>,
    Json(update): Json<Update>,
) -> impl IntoResponse {
    if !secret_matches(state.secret.as_ref(), &headers) {
        warn!("Telegram webhook call with invalid secret token");
        return StatusCode::UNAUTHORIZED;
    }

    debug!(update_id = update.update_id, "Telegram update received");
    if let Some(inbound) = update.into_inbound() {
        tokio::spawn(Arc::clone(&state.dispatcher).handle(inbound));
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_header_is_checked() {
        let secret = SecretString::from("s3cret".to_string());
        let mut headers = HeaderMap::new();
        assert!(secret_matches(None, &headers));
        assert!(!secret_matches(Some(&secret), &headers));

        headers.insert(SECRET_TOKEN_HEADER, HeaderValue::from_static("wrong"));
        assert!(!secret_matches(Some(&secret), &headers));

        headers.insert(SECRET_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(secret_matches(Some(&secret), &headers));
    }
}
