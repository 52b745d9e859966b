//! Hosting-service collaborator API (GitHub REST v3).

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

use super::error::{Error, Result};
use super::model::Permission;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const SERVICE: &str = "github";

/// Result of an add-collaborator call that the API accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddCollaborator {
    /// An invitation was created (`201 Created`).
    Invited,
    /// The user already had access (`204 No Content`).
    AlreadyCollaborator,
}

#[async_trait]
pub trait HostingService: Send + Sync {
    /// # Errors
    /// `Upstream` when the API call fails or answers unexpectedly.
    async fn is_collaborator(&self, org: &str, repo: &str, username: &str) -> Result<bool>;

    /// # Errors
    /// `Upstream` when the API call fails or answers unexpectedly.
    async fn add_collaborator(
        &self,
        org: &str,
        repo: &str,
        username: &str,
        permission: Permission,
    ) -> Result<AddCollaborator>;
}

pub struct GitHubClient {
    client: Client,
    api_url: Url,
    token: SecretString,
}

impl GitHubClient {
    /// # Errors
    /// Returns an error if the API URL is invalid or the HTTP client cannot be built.
    pub fn new(api_url: &str, token: SecretString) -> anyhow::Result<Self> {
        let api_url = Url::parse(api_url)
            .with_context(|| format!("invalid GitHub API URL: {api_url}"))?;
        if api_url.cannot_be_a_base() {
            return Err(anyhow!("GitHub API URL cannot be a base: {api_url}"));
        }
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            api_url,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::upstream(SERVICE, "API URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn collaborator_url(&self, org: &str, repo: &str, username: &str) -> Result<Url> {
        self.endpoint(&["repos", org, repo, "collaborators", username])
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Check the token at startup.
    ///
    /// # Errors
    /// Returns an error if GitHub rejects the token or is unreachable.
    #[instrument(skip(self))]
    pub async fn verify_credentials(&self) -> anyhow::Result<String> {
        let url = self
            .endpoint(&["user"])
            .map_err(|e| anyhow!(e.to_string()))?;
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .context("GitHub API unreachable")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "GitHub credential check failed: {}",
                failure_detail(response).await
            ));
        }
        let body: Value = response.json().await.context("invalid GitHub /user body")?;
        let login = body["login"].as_str().unwrap_or_default().to_string();
        debug!(login = %login, "GitHub credentials verified");
        Ok(login)
    }
}

/// `"<status> <message>"` from an error response.
async fn failure_detail(response: Response) -> String {
    let status = response.status();
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body["message"].as_str().map(ToString::to_string))
        .unwrap_or_default();
    if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}, {message}")
    }
}

#[async_trait]
impl HostingService for GitHubClient {
    #[instrument(skip(self))]
    async fn is_collaborator(&self, org: &str, repo: &str, username: &str) -> Result<bool> {
        let url = self.collaborator_url(org, repo, username)?;
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| Error::upstream(SERVICE, e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Error::upstream(SERVICE, failure_detail(response).await)),
        }
    }

    #[instrument(skip(self))]
    async fn add_collaborator(
        &self,
        org: &str,
        repo: &str,
        username: &str,
        permission: Permission,
    ) -> Result<AddCollaborator> {
        let url = self.collaborator_url(org, repo, username)?;
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(&json!({ "permission": permission.as_str() }))
            .send()
            .await
            .map_err(|e| Error::upstream(SERVICE, e.to_string()))?;

        match response.status() {
            StatusCode::CREATED => Ok(AddCollaborator::Invited),
            StatusCode::NO_CONTENT => Ok(AddCollaborator::AlreadyCollaborator),
            _ => Err(Error::upstream(SERVICE, failure_detail(response).await)),
        }
    }
}
