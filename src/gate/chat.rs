//! Transport-neutral chat surface: outbound messages and inbound parsing.

use anyhow::Result;
use async_trait::async_trait;

use super::model::RequesterId;

/// Outbound side of the chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, requester: RequesterId, text: &str) -> Result<()>;
}

/// One inbound message, already split into command and arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Command {
        requester: RequesterId,
        handle: Option<String>,
        /// Lowercased command name without the leading `/` or `@bot` suffix.
        name: String,
        args: Vec<String>,
    },
    Text {
        requester: RequesterId,
        handle: Option<String>,
        text: String,
    },
}

impl Inbound {
    /// Classify raw message text.
    #[must_use]
    pub fn parse(requester: RequesterId, handle: Option<String>, text: &str) -> Self {
        let trimmed = text.trim();
        let Some(body) = trimmed.strip_prefix('/') else {
            return Self::Text {
                requester,
                handle,
                text: trimmed.to_string(),
            };
        };

        let mut words = body.split_whitespace();
        let head = words.next().unwrap_or_default();
        let name = head
            .split_once('@')
            .map_or(head, |(command, _bot)| command)
            .to_ascii_lowercase();
        Self::Command {
            requester,
            handle,
            name,
            args: words.map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn requester(&self) -> RequesterId {
        match self {
            Self::Command { requester, .. } | Self::Text { requester, .. } => *requester,
        }
    }

    #[must_use]
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Command { handle, .. } | Self::Text { handle, .. } => handle.as_deref(),
        }
    }
}
