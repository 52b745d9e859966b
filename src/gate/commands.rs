//! Command routing and reply rendering.
//!
//! Every inbound message is handled in its own task. Engine errors are
//! recovered here, logged at a level chosen by their class, and turned into
//! a reply for the requester.

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::access::AccessModel;
use super::chat::{ChatTransport, Inbound};
use super::codes::CODE_LENGTH;
use super::error::{Error, ErrorClass, Result};
use super::model::{Repository, RequesterId};
use super::reconcile::{AccessReconciler, GrantOutcome};
use super::store::PersistentStore;
use super::workflow::{CodeOutcome, IdentityState, VerificationWorkflow};

pub const USAGE: &str = "\
Available commands:
/verify <github-username> <email> - verify your institutional email
/code <code> - submit the code you received (or just send it)
/update <github-username> <email> - change your verified details
/status - show your verification status
/access - list the repositories your level includes
/access <repository> - get read access to a repository
/repos - list the repositories you can access now
/menu - show this message";

pub const ADMIN_USAGE: &str = "\
Administrative commands:
/admin addrepository <name> <url> <min-rank> [owner]
/admin removerepository <name>
/admin addlevel <name> <rank>
/admin removelevel <name>
/admin setlevel <requester-id> <level>
/admin addblacklist <email> [requester-id]
/admin delblacklist <email>
/admin levels";

const NO_PENDING_CODE: &str = "Invalid code: no verification is pending. Send /verify first.";

pub struct Dispatcher {
    pub(super) workflow: Arc<VerificationWorkflow>,
    pub(super) reconciler: AccessReconciler,
    pub(super) access: Arc<AccessModel>,
    pub(super) store: Arc<dyn PersistentStore>,
    pub(super) chat: Arc<dyn ChatTransport>,
    /// Owner used by `addrepository` when none is given.
    pub(super) default_owner: String,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        workflow: Arc<VerificationWorkflow>,
        reconciler: AccessReconciler,
        access: Arc<AccessModel>,
        store: Arc<dyn PersistentStore>,
        chat: Arc<dyn ChatTransport>,
        default_owner: String,
    ) -> Self {
        Self {
            workflow,
            reconciler,
            access,
            store,
            chat,
            default_owner,
        }
    }

    /// Route one message and send the reply.
    pub async fn handle(self: Arc<Self>, inbound: Inbound) {
        let requester = inbound.requester();
        let span = info_span!("chat.message", requester);
        async move {
            let reply = match self.route(inbound).await {
                Ok(reply) => reply,
                Err(err) => {
                    log_error(requester, &err);
                    self.render_error(&err)
                }
            };
            if let Err(err) = self.chat.send(requester, &reply).await {
                error!(requester, "failed to send reply: {err:#}");
            }
        }
        .instrument(span)
        .await;
    }

    /// Compute the reply for one message without sending it.
    ///
    /// # Errors
    /// Any engine error; callers render it with [`Dispatcher::render_error`].
    pub async fn route(&self, inbound: Inbound) -> Result<String> {
        match inbound {
            Inbound::Text {
                requester, text, ..
            } => self.on_text(requester, &text).await,
            Inbound::Command {
                requester,
                handle,
                name,
                args,
            } => {
                debug!(requester, command = %name, "command received");
                self.on_command(requester, handle, &name, &args).await
            }
        }
    }

    async fn on_text(&self, requester: RequesterId, text: &str) -> Result<String> {
        if self.workflow.has_pending_code(requester).await {
            return self.submit_code(requester, text).await;
        }
        if text.chars().count() == CODE_LENGTH && !text.contains(char::is_whitespace) {
            return Ok(NO_PENDING_CODE.to_string());
        }
        Ok("Invalid message. Send /menu for the list of commands.".to_string())
    }

    async fn on_command(
        &self,
        requester: RequesterId,
        handle: Option<String>,
        name: &str,
        args: &[String],
    ) -> Result<String> {
        match name {
            "start" => Ok(format!(
                "Welcome! This bot grants read access to the course repositories.\n\n{USAGE}"
            )),
            "menu" | "help" => Ok(USAGE.to_string()),
            "verify" | "verifica" => {
                let [username, email] = args else {
                    return Err(usage("/verify <github-username> <email>"));
                };
                let pending = self
                    .workflow
                    .request_verification(requester, handle, username, email)
                    .await?;
                Ok(format!(
                    "A verification code was sent to {}. Reply with the code within {} minutes.",
                    pending.email,
                    pending.expires_in.as_secs().div_ceil(60)
                ))
            }
            "code" => {
                let [code] = args else {
                    return Err(usage("/code <code>"));
                };
                if !self.workflow.has_pending_code(requester).await {
                    return Ok(NO_PENDING_CODE.to_string());
                }
                self.submit_code(requester, code).await
            }
            "update" | "aggiorna" => {
                let [username, email] = args else {
                    return Err(usage("/update <github-username> <email>"));
                };
                let user = self
                    .workflow
                    .update_profile(requester, handle, username, email)
                    .await?;
                Ok(format!(
                    "Profile updated: {} <{}>.",
                    user.external_username, user.email
                ))
            }
            "status" => Ok(match self.workflow.state(requester).await? {
                IdentityState::Unknown => {
                    "You are not verified. Send /verify <github-username> <email>.".to_string()
                }
                IdentityState::Pending { email, .. } => {
                    format!("A verification code was sent to {email} and is waiting for you.")
                }
                IdentityState::Verified(user) => format!(
                    "Verified as {} <{}>, level rank {}.",
                    user.external_username, user.email, user.access_level_rank
                ),
            }),
            "access" | "accedi" => match args {
                [] => {
                    let repos = self.reconciler.entitlement(requester).await?;
                    Ok(list_repositories(
                        "Your level includes:",
                        "Your level does not include any repository yet.",
                        &repos,
                    ))
                }
                [repository] => Ok(match self.reconciler.ensure(requester, repository).await? {
                    GrantOutcome::AlreadyGranted(repo) => {
                        format!("You already have access to {}: {}", repo.name, repo.url)
                    }
                    GrantOutcome::InviteSent(repo) => format!(
                        "Invitation to {} sent. Accept it from your GitHub notifications: {}",
                        repo.name, repo.url
                    ),
                }),
                _ => Err(usage("/access [repository]")),
            },
            "repos" | "accessi" => {
                let repos = self.reconciler.accessible_repositories(requester).await?;
                Ok(list_repositories(
                    "You have access to:",
                    "You do not have access to any repository yet. Use /access.",
                    &repos,
                ))
            }
            "admin" => self.admin(requester, args).await,
            _ => Ok("Unknown command. Send /menu for the list of commands.".to_string()),
        }
    }

    async fn submit_code(&self, requester: RequesterId, code: &str) -> Result<String> {
        Ok(match self.workflow.submit_code(requester, code).await? {
            CodeOutcome::Verified(user) => format!(
                "Verified as {} <{}>. Send /access to see your repositories.",
                user.external_username, user.email
            ),
            CodeOutcome::Invalid => "Invalid code.".to_string(),
        })
    }

    /// User-facing text for an engine error.
    #[must_use]
    pub fn render_error(&self, err: &Error) -> String {
        match err {
            Error::InvalidInput(detail) => format!("Invalid input: {detail}"),
            Error::EmailDomain(email) => format!(
                "{email} is not an allowed address. Use an address ending in @{}.",
                self.workflow.config().allowed_domains().join(" or @")
            ),
            Error::NotFound {
                kind: "pending verification",
                ..
            } => "Your verification expired. Send /verify again.".to_string(),
            Error::NotFound { kind, name } => format!("Unknown {kind}: {name}"),
            Error::DuplicateName { kind, name } => format!("The {kind} {name} already exists."),
            Error::AlreadyVerified { email, username } => format!(
                "You are already verified as {username} <{email}>. \
                 Use /update to change your details."
            ),
            Error::NotVerified => {
                "You are not verified yet. Send /verify <github-username> <email> first."
                    .to_string()
            }
            Error::NotEntitled(repository) => {
                format!("Your level does not include the repository {repository}.")
            }
            Error::Blocked => "You are not allowed to use this bot.".to_string(),
            Error::NotAdmin(_) => "This command is reserved to administrators.".to_string(),
            Error::Upstream { service, .. } => {
                format!("The {service} service is not available right now. Try again later.")
            }
            Error::Storage(_) => "Internal error. Try again later.".to_string(),
        }
    }
}

pub(super) fn usage(form: &str) -> Error {
    Error::InvalidInput(format!("usage: {form}"))
}

fn list_repositories(header: &str, empty: &str, repos: &[Repository]) -> String {
    if repos.is_empty() {
        return empty.to_string();
    }
    let mut text = header.to_string();
    for repo in repos {
        let _ = write!(text, "\n- {} {}", repo.name, repo.url);
    }
    text
}

fn log_error(requester: RequesterId, err: &Error) {
    match err.class() {
        ErrorClass::InvalidInput => debug!(requester, "{err}"),
        ErrorClass::NotFound | ErrorClass::Conflict => info!(requester, "{err}"),
        ErrorClass::Unauthorized => warn!(requester, "{err}"),
        ErrorClass::Upstream | ErrorClass::Internal => error!(requester, "{err}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn repo(name: &str) -> Repository {
        Repository {
            name: name.to_string(),
            url: format!("https://github.com/org/{name}"),
            owner: "org".to_string(),
            minimum_rank: 0,
        }
    }

    #[test]
    fn repository_list_rendering() {
        assert_eq!(list_repositories("Have:", "None.", &[]), "None.");
        assert_eq!(
            list_repositories("Have:", "None.", &[repo("lab1"), repo("lab2")]),
            "Have:\n- lab1 https://github.com/org/lab1\n- lab2 https://github.com/org/lab2"
        );
    }

    #[test]
    fn usage_is_invalid_input() {
        let err = usage("/code <code>");
        assert_eq!(err.class(), ErrorClass::InvalidInput);
        assert_eq!(err.to_string(), "invalid input: usage: /code <code>");
    }
}
