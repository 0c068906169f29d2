//! Environment-driven credential selection for the remote agents service.
//!
//! The runtime environment is supplied by the caller — this crate never
//! self-detects where it is running. Local development gets a chained
//! credential over developer-oriented token sources; a DevOps pipeline
//! gets a single managed-identity credential with no interactive
//! fallback.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::or_cancel;

/// Environment variable consulted by the first chain member.
const TOKEN_ENV_VAR: &str = "SPECFIX_AGENT_TOKEN";

/// Developer CLI credential cache, relative to the home directory.
const CLI_CACHE_RELATIVE_PATH: &str = ".specfix/credentials.json";

/// IMDS-style token endpoint used inside pipeline agents.
const MANAGED_IDENTITY_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const MANAGED_IDENTITY_API_VERSION: &str = "2018-02-01";
const TOKEN_RESOURCE: &str = "https://cognitiveservices.azure.com";

/// Where this process is running. Supplied by the caller, never detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    LocalDevelopment,
    DevOpsPipeline,
}

impl FromStr for RuntimeEnvironment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local-development" | "localdevelopment" => {
                Ok(RuntimeEnvironment::LocalDevelopment)
            }
            "pipeline" | "devops" | "devops-pipeline" | "devopspipeline" => {
                Ok(RuntimeEnvironment::DevOpsPipeline)
            }
            other => Err(Error::validation(
                "environment",
                format!("unsupported runtime environment '{other}'"),
            )),
        }
    }
}

/// Pass-through options for credential construction. The selector applies
/// these to the underlying client unmodified and performs no retry logic
/// of its own.
#[derive(Debug, Clone, Default)]
pub struct CredentialOptions {
    /// Per-request timeout for token acquisition.
    pub timeout: Option<Duration>,
    /// Managed identity client id, for user-assigned identities.
    pub client_id: Option<String>,
}

/// An acquired bearer token. The secret is deliberately excluded from
/// `Debug` output.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    /// Seconds until expiry as reported by the source, when known.
    pub expires_in: Option<u64>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self {
            secret: secret.into(),
            expires_in,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// An opaque token-producing capability.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Short stable identifier used in logs and chain diagnostics.
    /// Never includes secret material.
    fn name(&self) -> &'static str;

    async fn get_token(&self, cancel: &CancellationToken) -> Result<AccessToken>;
}

/// Reads the token from a process environment variable.
pub struct EnvTokenCredential {
    var: String,
}

impl EnvTokenCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenCredential {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

#[async_trait]
impl TokenCredential for EnvTokenCredential {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn get_token(&self, _cancel: &CancellationToken) -> Result<AccessToken> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(AccessToken::new(value, None)),
            _ => Err(Error::Auth(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

#[derive(Deserialize)]
struct CliCacheFile {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "expiresIn")]
    expires_in: Option<u64>,
}

/// Reads the developer CLI's cached credential file from the home
/// directory (JSON with an `accessToken` field).
pub struct CliCacheCredential {
    path: Option<PathBuf>,
}

impl CliCacheCredential {
    pub fn new() -> Self {
        Self {
            path: dirs::home_dir().map(|home| home.join(CLI_CACHE_RELATIVE_PATH)),
        }
    }

    /// Override the cache location. Test seam.
    pub fn with_path(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }
}

impl Default for CliCacheCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCredential for CliCacheCredential {
    fn name(&self) -> &'static str {
        "cli_cache"
    }

    async fn get_token(&self, _cancel: &CancellationToken) -> Result<AccessToken> {
        let Some(path) = &self.path else {
            return Err(Error::Auth(
                "could not determine home directory for CLI credential cache".to_string(),
            ));
        };
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            debug!(path = %path.display(), error = %e, "CLI credential cache unavailable");
            Error::Auth(format!("cannot read credential cache {}: {e}", path.display()))
        })?;
        let cache: CliCacheFile = serde_json::from_str(&content).map_err(|e| {
            warn!(path = %path.display(), "CLI credential cache is not valid JSON");
            Error::Auth(format!("credential cache {} is malformed: {e}", path.display()))
        })?;
        match cache.access_token {
            Some(token) if !token.trim().is_empty() => {
                debug!("found CLI credential cache token");
                Ok(AccessToken::new(token, cache.expires_in))
            }
            _ => Err(Error::Auth(format!(
                "credential cache {} has no accessToken",
                path.display()
            ))),
        }
    }
}

/// Tries each member source in order; the first token wins. Fails
/// terminally only when every member has failed, with each member's
/// reason aggregated into the error.
pub struct ChainedTokenCredential {
    sources: Vec<Box<dyn TokenCredential>>,
}

impl ChainedTokenCredential {
    pub fn new(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// The developer-oriented default chain: process environment, then
    /// the CLI credential cache.
    pub fn developer_defaults() -> Self {
        Self::new(vec![
            Box::new(EnvTokenCredential::default()),
            Box::new(CliCacheCredential::new()),
        ])
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl TokenCredential for ChainedTokenCredential {
    fn name(&self) -> &'static str {
        "chained"
    }

    async fn get_token(&self, cancel: &CancellationToken) -> Result<AccessToken> {
        let mut failures = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.get_token(cancel).await {
                Ok(token) => {
                    debug!(source = source.name(), "credential chain member produced a token");
                    return Ok(token);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => failures.push(format!("{}: {e}", source.name())),
            }
        }
        Err(Error::Auth(format!(
            "no credential source produced a token ({})",
            failures.join("; ")
        )))
    }
}

#[derive(Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    expires_in: Option<String>,
}

/// Single managed-identity credential for pipeline runs. Queries the
/// instance metadata token endpoint directly; there is no interactive
/// fallback, and an unavailable identity fails fast.
pub struct ManagedIdentityCredential {
    endpoint: String,
    client_id: Option<String>,
    http: reqwest::Client,
}

impl ManagedIdentityCredential {
    pub fn new(options: &CredentialOptions) -> Result<Self> {
        Self::with_endpoint(MANAGED_IDENTITY_ENDPOINT, options)
    }

    /// Override the token endpoint. Test seam.
    pub fn with_endpoint(endpoint: impl Into<String>, options: &CredentialOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            endpoint: endpoint.into(),
            client_id: options.client_id.clone(),
            http: builder.build()?,
        })
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "managed_identity"
    }

    async fn get_token(&self, cancel: &CancellationToken) -> Result<AccessToken> {
        let mut query = vec![
            ("api-version", MANAGED_IDENTITY_API_VERSION),
            ("resource", TOKEN_RESOURCE),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let request = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send();
        let response = or_cancel(request, cancel).await??;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "managed identity endpoint returned {status}"
            )));
        }
        let body: ManagedIdentityResponse = response.json().await?;
        debug!("managed identity token acquired");
        Ok(AccessToken::new(
            body.access_token,
            body.expires_in.and_then(|s| s.parse().ok()),
        ))
    }
}

/// Build the credential strategy for `environment`.
///
/// `options` pass through unmodified; no retry logic is layered on. The
/// chosen branch is logged at debug level — never any secret material.
pub fn create_credential(
    environment: RuntimeEnvironment,
    options: &CredentialOptions,
) -> Result<Arc<dyn TokenCredential>> {
    match environment {
        RuntimeEnvironment::LocalDevelopment => {
            debug!("selected developer credential chain");
            Ok(Arc::new(ChainedTokenCredential::developer_defaults()))
        }
        RuntimeEnvironment::DevOpsPipeline => {
            debug!("selected managed identity credential");
            Ok(Arc::new(ManagedIdentityCredential::new(options)?))
        }
    }
}
