pub mod health;
pub use self::health::health;

pub mod webhook;
pub use self::webhook::{telegram_webhook, WebhookState};
