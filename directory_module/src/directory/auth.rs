//! OAuth 2.0 client-credentials tokens for the Graph API.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use super::graph::GraphConfig;

const TOKEN_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Tokens are refreshed this long before their reported expiry.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum GraphAuthError {
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("token request failed: {0}")]
    Http(String),
    #[error("token endpoint returned {status}: {body}")]
    TokenRejected { status: u16, body: String },
    #[error("token response malformed: {0}")]
    Json(String),
}

impl GraphAuthError {
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            GraphAuthError::Http(_) => true,
            GraphAuthError::TokenRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Cached client-credentials token source for one tenant.
#[derive(Debug, Clone)]
pub struct GraphAuth {
    inner: Arc<RwLock<GraphAuthInner>>,
}

#[derive(Debug)]
struct GraphAuthInner {
    login_url: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
    access_token: Option<String>,
    token_expires_at: Option<Instant>,
}

impl GraphAuth {
    pub fn new(config: &GraphConfig) -> Result<Self, GraphAuthError> {
        for (name, value) in [
            ("tenant id", &config.tenant_id),
            ("client id", &config.client_id),
            ("client secret", &config.client_secret),
        ] {
            if value.trim().is_empty() {
                return Err(GraphAuthError::MissingCredentials(name.to_string()));
            }
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(GraphAuthInner {
                login_url: config.login_url.trim_end_matches('/').to_string(),
                tenant_id: config.tenant_id.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                timeout: config.timeout,
                access_token: None,
                token_expires_at: None,
            })),
        })
    }

    /// Returns a bearer token, refreshing it when missing or near expiry.
    pub fn get_access_token(&self) -> Result<String, GraphAuthError> {
        {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(|poison| poison.into_inner());
            if let (Some(token), Some(expires_at)) =
                (inner.access_token.as_ref(), inner.token_expires_at)
            {
                if Instant::now() + EXPIRY_BUFFER < expires_at {
                    return Ok(token.clone());
                }
            }
        }
        self.refresh_access_token()
    }

    fn refresh_access_token(&self) -> Result<String, GraphAuthError> {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        // Another thread may have refreshed while we waited for the lock.
        if let (Some(token), Some(expires_at)) =
            (inner.access_token.as_ref(), inner.token_expires_at)
        {
            if Instant::now() + EXPIRY_BUFFER < expires_at {
                return Ok(token.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            inner.login_url, inner.tenant_id
        );
        let client = reqwest::blocking::Client::builder()
            .timeout(inner.timeout)
            .build()
            .map_err(|err| GraphAuthError::Http(err.to_string()))?;
        let response = client
            .post(&url)
            .form(&[
                ("client_id", inner.client_id.as_str()),
                ("client_secret", inner.client_secret.as_str()),
                ("scope", TOKEN_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .map_err(|err| GraphAuthError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GraphAuthError::TokenRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: OAuthTokenResponse = response
            .json()
            .map_err(|err| GraphAuthError::Json(err.to_string()))?;
        debug!("refreshed graph token, expires in {}s", token.expires_in);
        let lifetime = Duration::from_secs(token.expires_in.max(0) as u64);
        inner.token_expires_at = Some(Instant::now() + lifetime);
        inner.access_token = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: i64,
    #[allow(dead_code)]
    token_type: Option<String>,
}
