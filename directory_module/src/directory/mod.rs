//! Identity and mail operations against the tenant directory.
//!
//! The pipeline talks to the directory through the [`DirectoryClient`]
//! trait; [`GraphDirectory`] is the Microsoft Graph implementation and
//! [`RetryingDirectory`] layers transient-fault retry on top of any
//! implementation.

mod auth;
mod graph;
mod retry;

pub use auth::{GraphAuth, GraphAuthError};
pub use graph::{GraphConfig, GraphDirectory};
pub use retry::{RetryPolicy, RetryingDirectory};

/// Message content fetched from the support mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub id: String,
    pub subject: Option<String>,
    /// Raw body as stored by the mail service, usually HTML.
    pub body: Option<String>,
    /// Address of the original sender.
    pub sender: Option<String>,
    /// First address on the To: line, if any.
    pub to_recipient: Option<String>,
}

/// Outbound reply handed to the mail service.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    pub subject: String,
    pub body_text: String,
    pub recipient: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("auth error: {0}")]
    Auth(#[from] GraphAuthError),
    #[error("directory config error: {0}")]
    Config(String),
}

impl DirectoryError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            DirectoryError::Http(_) => true,
            DirectoryError::Api { status, .. } => *status == 429 || *status >= 500,
            DirectoryError::Auth(err) => err.is_transient(),
            DirectoryError::Config(_) => false,
        }
    }
}

/// Directory operations the reply pipeline consumes.
pub trait DirectoryClient: Send + Sync {
    /// Fetch a message from the support mailbox. `None` when the id is unknown.
    fn fetch_message_by_id(
        &self,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, DirectoryError>;

    /// Resolve a mail address to a directory user id. `None` when no user matches.
    fn resolve_user_id(&self, address: &str) -> Result<Option<String>, DirectoryError>;

    /// Send `reply` in response to `message_id`, acting as directory user `user_id`.
    fn send_reply(
        &self,
        user_id: &str,
        message_id: &str,
        reply: &ReplyMessage,
    ) -> Result<(), DirectoryError>;
}
