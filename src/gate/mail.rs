//! Outbound mail queue and delivery backends.
//!
//! The workflow hands messages to a `Mailer`, which only enqueues them. A
//! background task drains the queue and passes each message to an
//! `EmailSender`. Delivery is fire-and-forget from the engine's side: failures
//! are logged by the worker and never reported back to the requester.
//!
//! `SmtpEmailSender` delivers through `lettre`'s pooled async SMTP transport.
//! `LogEmailSender` only logs, and is used when no SMTP host is configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, Instrument};

pub const VERIFICATION_SUBJECT: &str = "Verification code for GitHub repository access";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub subject: String,
    pub body_html: String,
}

impl EmailMessage {
    /// The message carrying a one-time verification code.
    #[must_use]
    pub fn verification(to_email: &str, code: &str, ttl: Duration) -> Self {
        let minutes = ttl.as_secs().div_ceil(60);
        Self {
            to_email: to_email.to_string(),
            subject: VERIFICATION_SUBJECT.to_string(),
            body_html: format!(
                "<p>Your verification code is:</p>\
                 <p><code>{code}</code></p>\
                 <p>Send it to the bot within {minutes} minutes.</p>"
            ),
        }
    }
}

/// Email delivery abstraction used by the mail worker.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error describing the failure.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            subject = %message.subject,
            "email send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from: String,
}

pub struct SmtpEmailSender {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpEmailSender {
    /// Build a STARTTLS relay transport.
    ///
    /// # Errors
    /// Returns an error if the relay host or the sender address is invalid.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("invalid sender address: {}", config.from))?;

        let credentials = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .with_context(|| format!("failed to create SMTP relay for {}", config.host))?
            .port(config.port)
            .credentials(credentials)
            .build();

        Ok(Self { from, transport })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let to: Mailbox = message
            .to_email
            .parse()
            .with_context(|| format!("invalid recipient: {}", message.to_email))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&message.subject)
            .header(ContentType::TEXT_HTML)
            .body(message.body_html.clone())
            .context("failed to build email")?;

        self.transport
            .send(email)
            .await
            .context("SMTP delivery failed")?;
        Ok(())
    }
}

/// Handle used by the engine to queue outbound mail.
#[derive(Clone)]
pub struct Mailer {
    queue: mpsc::UnboundedSender<EmailMessage>,
}

impl Mailer {
    /// Queue a message for delivery.
    ///
    /// # Errors
    /// Returns an error if the worker is gone.
    pub fn queue(&self, message: EmailMessage) -> Result<()> {
        self.queue
            .send(message)
            .map_err(|_| anyhow::anyhow!("mail worker is not running"))
    }
}

/// Spawn the worker draining the queue into `sender`.
pub fn spawn_mail_worker(sender: Arc<dyn EmailSender>) -> (Mailer, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<EmailMessage>();

    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let span = info_span!("mail.send", to_email = %message.to_email);
            let result = sender.send(&message).instrument(span).await;
            match result {
                Ok(()) => info!(to_email = %message.to_email, "email delivered"),
                Err(err) => error!(to_email = %message.to_email, "email delivery failed: {err:#}"),
            }
        }
        info!("mail worker stopped");
    });

    (Mailer { queue: tx }, handle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl EmailSender for Recording {
        async fn send(&self, message: &EmailMessage) -> Result<()> {
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EmailSender for Failing {
        async fn send(&self, _message: &EmailMessage) -> Result<()> {
            Err(anyhow::anyhow!("relay refused"))
        }
    }

    #[test]
    fn verification_message_contains_code() {
        let message = EmailMessage::verification(
            "student@unito.it",
            "AbCdEfGh1234",
            Duration::from_secs(900),
        );
        assert_eq!(message.to_email, "student@unito.it");
        assert_eq!(message.subject, VERIFICATION_SUBJECT);
        assert!(message.body_html.contains("AbCdEfGh1234"));
        assert!(message.body_html.contains("15 minutes"));
    }

    #[tokio::test]
    async fn worker_delivers_queued_messages() {
        let recording = Arc::new(Recording::default());
        let (mailer, handle) = spawn_mail_worker(recording.clone());

        let message = EmailMessage::verification("a@unito.it", "code", Duration::from_secs(60));
        mailer.queue(message.clone()).unwrap();
        drop(mailer);
        handle.await.unwrap();

        assert_eq!(recording.sent.lock().await.as_slice(), &[message]);
    }

    #[tokio::test]
    async fn worker_survives_delivery_failures() {
        let (mailer, handle) = spawn_mail_worker(Arc::new(Failing));
        let message = EmailMessage::verification("a@unito.it", "code", Duration::from_secs(60));
        mailer.queue(message.clone()).unwrap();
        mailer.queue(message).unwrap();
        drop(mailer);
        handle.await.unwrap();
    }

    #[test]
    fn smtp_sender_rejects_bad_from_address() {
        let config = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "bot".to_string(),
            password: SecretString::from("secret".to_string()),
            from: "not an address".to_string(),
        };
        assert!(SmtpEmailSender::new(&config).is_err());
    }

    #[tokio::test]
    async fn log_sender_accepts_everything() {
        let message = EmailMessage::verification("a@unito.it", "code", Duration::from_secs(60));
        assert!(LogEmailSender.send(&message).await.is_ok());
    }
}
