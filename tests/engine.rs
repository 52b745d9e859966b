//! End-to-end conversations against a fully wired engine.
//!
//! The durable store is in memory and the chat, mail and hosting adapters are
//! recording fakes, so every scenario runs without network access.
#![allow(clippy::unwrap_used)]

use anyhow::Result;
use async_trait::async_trait;
use repogate::gate::chat::{ChatTransport, Inbound};
use repogate::gate::github::{AddCollaborator, HostingService};
use repogate::gate::mail::{EmailMessage, EmailSender};
use repogate::gate::model::{Permission, RequesterId};
use repogate::gate::store::{MemoryStore, PersistentStore};
use repogate::gate::workflow::VerificationConfig;
use repogate::gate::Engine;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const ADMIN: RequesterId = 1;
const STUDENT: RequesterId = 42;

#[derive(Default)]
struct RecordingChat {
    sent: Mutex<Vec<(RequesterId, String)>>,
}

#[async_trait]
impl ChatTransport for RecordingChat {
    async fn send(&self, requester: RequesterId, text: &str) -> Result<()> {
        self.sent.lock().await.push((requester, text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingMail {
    sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl EmailSender for RecordingMail {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeHosting {
    collaborators: Mutex<HashSet<(String, String)>>,
    calls: AtomicUsize,
}

#[async_trait]
impl HostingService for FakeHosting {
    async fn is_collaborator(
        &self,
        _org: &str,
        repo: &str,
        username: &str,
    ) -> repogate::gate::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .collaborators
            .lock()
            .await
            .contains(&(repo.to_string(), username.to_string())))
    }

    async fn add_collaborator(
        &self,
        _org: &str,
        repo: &str,
        username: &str,
        permission: Permission,
    ) -> repogate::gate::Result<AddCollaborator> {
        assert_eq!(permission, Permission::Pull);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.collaborators
            .lock()
            .await
            .insert((repo.to_string(), username.to_string()));
        Ok(AddCollaborator::Invited)
    }
}

struct Harness {
    engine: Engine,
    store: Arc<MemoryStore>,
    chat: Arc<RecordingChat>,
    mail: Arc<RecordingMail>,
    hosting: Arc<FakeHosting>,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(RecordingChat::default());
        let mail = Arc::new(RecordingMail::default());
        let hosting = Arc::new(FakeHosting::default());
        let verification =
            VerificationConfig::new(vec!["unito.it".to_string()]).with_admin_ids([ADMIN]);
        let engine = Engine::build(
            store.clone(),
            chat.clone(),
            hosting.clone(),
            mail.clone(),
            verification,
            "course-org".to_string(),
        )
        .await
        .unwrap();
        Self {
            engine,
            store,
            chat,
            mail,
            hosting,
        }
    }

    /// Send one message the way the chat adapter would and return the reply.
    async fn say(&self, requester: RequesterId, text: &str) -> String {
        let inbound = Inbound::parse(requester, Some(format!("user{requester}")), text);
        match self.engine.dispatcher.route(inbound).await {
            Ok(reply) => reply,
            Err(err) => self.engine.dispatcher.render_error(&err),
        }
    }

    /// The code from the most recent mail to `email`, once the worker has sent it.
    async fn code_for(&self, email: &str) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = self
                    .mail
                    .sent
                    .lock()
                    .await
                    .iter()
                    .rev()
                    .find(|m| m.to_email == email)
                    .map(|m| m.body_html.clone());
                if let Some(body) = found {
                    let start = body.find("<code>").unwrap() + "<code>".len();
                    let end = body.find("</code>").unwrap();
                    return body[start..end].to_string();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn verify(&self, requester: RequesterId, username: &str, email: &str) {
        let reply = self
            .say(requester, &format!("/verify {username} {email}"))
            .await;
        assert!(reply.starts_with("A verification code was sent"), "{reply}");
        let code = self.code_for(email).await;
        let reply = self.say(requester, &code).await;
        assert!(reply.starts_with("Verified as"), "{reply}");
    }

    fn hosting_calls(&self) -> usize {
        self.hosting.calls.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn repository_added_after_level_is_listed_for_it() {
    let h = Harness::new().await;

    let reply = h.say(ADMIN, "/admin addlevel intro 1").await;
    assert!(reply.starts_with("Level intro (rank 1) added"), "{reply}");
    let reply = h
        .say(ADMIN, "/admin addrepository lab1 https://github.com/course-org/lab1 1")
        .await;
    assert!(reply.starts_with("Repository lab1 added"), "{reply}");

    let levels = h.say(ADMIN, "/admin levels").await;
    assert!(levels.contains("- intro (rank 1): lab1"), "{levels}");
    assert_eq!(
        h.engine.access.repository("lab1").await.unwrap().owner,
        "course-org"
    );
}

#[tokio::test]
async fn code_verifies_once() {
    let h = Harness::new().await;

    let reply = h.say(STUDENT, "/verify octocat student@unito.it").await;
    assert!(reply.contains("student@unito.it"), "{reply}");
    let code = h.code_for("student@unito.it").await;
    assert_eq!(code.len(), 12);

    let status = h.say(STUDENT, "/status").await;
    assert!(status.contains("waiting"), "{status}");

    let reply = h.say(STUDENT, &code).await;
    assert_eq!(
        reply,
        "Verified as octocat <student@unito.it>. Send /access to see your repositories."
    );
    let user = h.store.get_user(STUDENT).await.unwrap().unwrap();
    assert!(user.verified);
    assert_eq!(user.display_handle.as_deref(), Some("user42"));

    let reply = h.say(STUDENT, &code).await;
    assert!(reply.starts_with("Invalid code"), "{reply}");
}

#[tokio::test]
async fn wrong_code_keeps_the_handshake_alive() {
    let h = Harness::new().await;

    h.say(STUDENT, "/verify octocat student@unito.it").await;
    let code = h.code_for("student@unito.it").await;

    assert_eq!(h.say(STUDENT, "AAAAAAAAAAAA").await, "Invalid code.");
    let reply = h.say(STUDENT, &format!("/code {code}")).await;
    assert!(reply.starts_with("Verified as octocat"), "{reply}");
}

#[tokio::test]
async fn disallowed_domain_is_refused() {
    let h = Harness::new().await;

    let reply = h.say(STUDENT, "/verify octocat student@gmail.com").await;
    assert!(reply.contains("not an allowed address"), "{reply}");
    assert!(reply.contains("@unito.it"), "{reply}");
    assert!(h.mail.sent.lock().await.is_empty());
}

#[tokio::test]
async fn not_entitled_request_makes_no_hosting_call() {
    let h = Harness::new().await;
    h.say(ADMIN, "/admin addlevel basic 1").await;
    h.say(ADMIN, "/admin addrepository lab1 https://github.com/course-org/lab1 1")
        .await;
    h.verify(STUDENT, "octocat", "student@unito.it").await;

    let reply = h.say(STUDENT, "/access lab1").await;
    assert_eq!(reply, "Your level does not include the repository lab1.");
    let reply = h.say(STUDENT, "/access").await;
    assert_eq!(reply, "Your level does not include any repository yet.");
    assert_eq!(h.hosting_calls(), 0);
}

#[tokio::test]
async fn granted_access_is_idempotent() {
    let h = Harness::new().await;
    h.say(ADMIN, "/admin addlevel basic 1").await;
    h.say(ADMIN, "/admin addrepository lab1 https://github.com/course-org/lab1 1")
        .await;
    h.verify(STUDENT, "octocat", "student@unito.it").await;

    let reply = h.say(ADMIN, &format!("/admin setlevel {STUDENT} basic")).await;
    assert_eq!(reply, "User 42 now has rank 1.");

    assert_eq!(
        h.say(STUDENT, "/repos").await,
        "You do not have access to any repository yet. Use /access."
    );
    let reply = h.say(STUDENT, "/access lab1").await;
    assert!(reply.starts_with("Invitation to lab1 sent"), "{reply}");
    let reply = h.say(STUDENT, "/access lab1").await;
    assert!(reply.starts_with("You already have access to lab1"), "{reply}");
    assert_eq!(
        h.say(STUDENT, "/repos").await,
        "You have access to:\n- lab1 https://github.com/course-org/lab1"
    );
    assert_eq!(h.hosting.collaborators.lock().await.len(), 1);
}

#[tokio::test]
async fn removing_a_repository_clears_every_level() {
    let h = Harness::new().await;
    h.say(ADMIN, "/admin addlevel basic 1").await;
    h.say(ADMIN, "/admin addlevel advanced 2").await;
    h.say(ADMIN, "/admin addrepository lab1 https://github.com/course-org/lab1 1")
        .await;
    assert!(h.engine.access.repos_for_level("advanced").await.unwrap().contains("lab1"));

    let reply = h.say(ADMIN, "/admin removerepository lab1").await;
    assert_eq!(reply, "Repository lab1 removed.");
    assert!(h.engine.access.repos_for_level("basic").await.unwrap().is_empty());
    assert!(h.engine.access.repos_for_level("advanced").await.unwrap().is_empty());
    assert!(h.store.get_repositories().await.unwrap().is_empty());
}

#[tokio::test]
async fn admin_commands_are_authorized_before_anything_else() {
    let h = Harness::new().await;

    let reply = h.say(STUDENT, "/admin addlevel sneaky 9").await;
    assert_eq!(reply, "This command is reserved to administrators.");
    let reply = h.say(STUDENT, "/admin bogus").await;
    assert_eq!(reply, "This command is reserved to administrators.");
    assert!(h.engine.access.levels().await.is_empty());
    assert!(h.store.get_levels().await.unwrap().is_empty());
}

#[tokio::test]
async fn block_list_removes_and_refuses_identity() {
    let h = Harness::new().await;
    h.verify(STUDENT, "octocat", "student@unito.it").await;

    let reply = h.say(ADMIN, "/admin addblacklist Student@unito.it").await;
    assert_eq!(reply, "student@unito.it block-listed; 1 user record(s) removed.");
    assert!(h.store.get_user(STUDENT).await.unwrap().is_none());

    let reply = h.say(STUDENT, "/verify octocat student@unito.it").await;
    assert_eq!(reply, "You are not allowed to use this bot.");

    let reply = h.say(ADMIN, "/admin delblacklist student@unito.it").await;
    assert_eq!(reply, "student@unito.it removed from the block list.");
    let reply = h.say(ADMIN, "/admin delblacklist student@unito.it").await;
    assert!(reply.starts_with("Unknown block-list entry"), "{reply}");
}

#[tokio::test]
async fn block_list_cancels_handshake_in_flight() {
    let h = Harness::new().await;

    h.say(STUDENT, "/verify octocat bad@unito.it").await;
    let code = h.code_for("bad@unito.it").await;

    let reply = h.say(ADMIN, &format!("/admin addblacklist bad@unito.it {STUDENT}")).await;
    assert_eq!(reply, "bad@unito.it block-listed; 0 user record(s) removed.");

    let reply = h.say(STUDENT, &code).await;
    assert!(
        reply.starts_with("Invalid code: no verification is pending"),
        "{reply}"
    );
    assert!(h.store.get_user(STUDENT).await.unwrap().is_none());
    assert!(h.say(STUDENT, "/status").await.starts_with("You are not verified"));
}

#[tokio::test]
async fn verified_requester_must_use_update() {
    let h = Harness::new().await;
    assert!(h
        .say(STUDENT, "/update octocat other@unito.it")
        .await
        .starts_with("You are not verified yet"));

    h.verify(STUDENT, "octocat", "student@unito.it").await;

    let reply = h.say(STUDENT, "/verify octocat student@unito.it").await;
    assert!(reply.contains("Use /update"), "{reply}");
    let reply = h.say(STUDENT, "/update hubber other@unito.it").await;
    assert_eq!(reply, "Profile updated: hubber <other@unito.it>.");
    let status = h.say(STUDENT, "/status").await;
    assert_eq!(status, "Verified as hubber <other@unito.it>, level rank 0.");
}

#[tokio::test]
async fn free_text_without_handshake() {
    let h = Harness::new().await;

    assert!(h
        .say(STUDENT, "hello there")
        .await
        .starts_with("Invalid message"));
    assert!(h
        .say(STUDENT, "ABCDEFGHIJKL")
        .await
        .starts_with("Invalid code: no verification is pending"));
    assert!(h.say(STUDENT, "/dance").await.starts_with("Unknown command"));
    assert!(h
        .say(STUDENT, "/verify octocat")
        .await
        .contains("usage: /verify <github-username> <email>"));
    assert!(h.say(STUDENT, "/start").await.contains("/access <repository>"));
}

#[tokio::test]
async fn handle_sends_reply_over_chat() {
    let h = Harness::new().await;

    Arc::clone(&h.engine.dispatcher)
        .handle(Inbound::parse(STUDENT, None, "/menu"))
        .await;
    Arc::clone(&h.engine.dispatcher)
        .handle(Inbound::parse(STUDENT, None, "/access"))
        .await;

    let sent = h.chat.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, STUDENT);
    assert!(sent[0].1.starts_with("Available commands:"));
    assert!(sent[1].1.starts_with("You are not verified yet"));
}
