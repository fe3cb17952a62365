//! Microsoft Graph client for the support mailbox.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::auth::GraphAuth;
use super::{DirectoryClient, DirectoryError, FetchedMessage, ReplyMessage};

const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";
const DEFAULT_MAILBOX: &str = "eba@ebarocks.onmicrosoft.com";
/// Upper bound on any single directory request.
const GRAPH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Mailbox that change notifications refer to.
    pub mailbox: String,
    pub base_url: String,
    pub login_url: String,
    pub timeout: Duration,
}

impl GraphConfig {
    pub fn from_env() -> Result<Self, DirectoryError> {
        dotenvy::dotenv().ok();
        let tenant_id = require_env("GRAPH_TENANT_ID")?;
        let client_id = require_env("GRAPH_CLIENT_ID")?;
        let client_secret = require_env("GRAPH_CLIENT_SECRET")?;
        let mailbox = env::var("SUPPORT_EMAIL_ADDRESS")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MAILBOX.to_string());
        let base_url = env::var("GRAPH_API_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string());
        let login_url = env::var("GRAPH_LOGIN_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string());
        Ok(Self {
            tenant_id,
            client_id,
            client_secret,
            mailbox,
            base_url,
            login_url,
            timeout: GRAPH_TIMEOUT,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, DirectoryError> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DirectoryError::Config(format!("{} is not set", key)))
}

/// Blocking Graph REST client scoped to one tenant and mailbox.
pub struct GraphDirectory {
    config: GraphConfig,
    auth: GraphAuth,
    client: reqwest::blocking::Client,
}

impl GraphDirectory {
    pub fn from_env() -> Result<Self, DirectoryError> {
        Self::new(GraphConfig::from_env()?)
    }

    pub fn new(config: GraphConfig) -> Result<Self, DirectoryError> {
        let auth = GraphAuth::new(&config)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            auth,
            client,
        })
    }

    fn bearer(&self) -> Result<String, DirectoryError> {
        Ok(format!("Bearer {}", self.auth.get_access_token()?))
    }
}

impl DirectoryClient for GraphDirectory {
    fn fetch_message_by_id(
        &self,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, DirectoryError> {
        // Graph item ids are base64ish and can carry '+', '/', '='.
        let url = format!(
            "{}/users/{}/messages/{}",
            self.config.base_url,
            self.config.mailbox,
            urlencoding::encode(message_id)
        );
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer()?)
            .send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(DirectoryError::Api { status, body });
        }
        let message: GraphMessage = response.json()?;
        Ok(Some(message.into_fetched()))
    }

    fn resolve_user_id(&self, address: &str) -> Result<Option<String>, DirectoryError> {
        let address = address.trim();
        if address.is_empty() {
            return Ok(None);
        }
        let url = format!("{}/users", self.config.base_url);
        // OData string literals escape single quotes by doubling them.
        let filter = format!("mail eq '{}'", address.replace('\'', "''"));
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer()?)
            .query(&[("$filter", filter.as_str()), ("$select", "id")])
            .send()?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(DirectoryError::Api { status, body });
        }
        let users: GraphUserCollection = response.json()?;
        Ok(users
            .value
            .into_iter()
            .map(|user| user.id)
            .find(|id| !id.is_empty()))
    }

    fn send_reply(
        &self,
        user_id: &str,
        message_id: &str,
        reply: &ReplyMessage,
    ) -> Result<(), DirectoryError> {
        let url = format!(
            "{}/users/{}/messages/{}/reply",
            self.config.base_url,
            urlencoding::encode(user_id),
            urlencoding::encode(message_id)
        );
        let request = ReplyRequest {
            message: ReplyRequestMessage {
                subject: reply.subject.clone(),
                body: GraphItemBody {
                    content_type: "Text".to_string(),
                    content: reply.body_text.clone(),
                },
                to_recipients: vec![ReplyRecipient {
                    email_address: ReplyEmailAddress {
                        address: reply.recipient.clone(),
                    },
                }],
            },
        };
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.bearer()?)
            .json(&request)
            .send()?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(DirectoryError::Api { status, body });
        }
        debug!("sent reply to {} for message {}", reply.recipient, message_id);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body: Option<GraphItemBody>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Option<Vec<GraphRecipient>>,
}

impl GraphMessage {
    fn into_fetched(self) -> FetchedMessage {
        let sender = self
            .from
            .and_then(|recipient| recipient.email_address)
            .and_then(|email| email.address);
        let to_recipient = self
            .to_recipients
            .unwrap_or_default()
            .into_iter()
            .filter_map(|recipient| recipient.email_address)
            .find_map(|email| email.address);
        FetchedMessage {
            id: self.id,
            subject: self.subject,
            body: self.body.map(|body| body.content),
            sender,
            to_recipient,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphItemBody {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    #[serde(default)]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphUserCollection {
    #[serde(default)]
    value: Vec<GraphUser>,
}

#[derive(Debug, Deserialize)]
struct GraphUser {
    id: String,
}

#[derive(Debug, Serialize)]
struct ReplyRequest {
    message: ReplyRequestMessage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequestMessage {
    subject: String,
    body: GraphItemBody,
    to_recipients: Vec<ReplyRecipient>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRecipient {
    email_address: ReplyEmailAddress,
}

#[derive(Debug, Serialize)]
struct ReplyEmailAddress {
    address: String,
}
