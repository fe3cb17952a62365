use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::service::BoxError;

/// Largest notification body the webhook endpoint will read.
pub const DEFAULT_NOTIFICATION_BODY_MAX_BYTES: usize = 1024 * 1024;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9001;
const DEFAULT_SUPPORT_ADDRESS: &str = "eba@ebarocks.onmicrosoft.com";
const DEFAULT_REPLY_SUBJECT_PREFIX: &str = "Re from Deflektor: ";
const DEFAULT_WORKER_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Mailbox the replies go out from, and the recipient of last resort.
    pub support_address: String,
    /// Prepended verbatim to the original subject on every reply.
    pub reply_subject_prefix: String,
    /// Expected `clientState` on notifications; `None` accepts any.
    pub client_state: Option<String>,
    pub processed_ids_path: PathBuf,
    pub worker_poll_interval: Duration,
    pub worker_concurrency: usize,
    pub notification_body_max_bytes: usize,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("RUST_SERVICE_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = env::var("RUST_SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let support_address = env::var("SUPPORT_EMAIL_ADDRESS")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SUPPORT_ADDRESS.to_string());

        // Not trimmed: a trailing space in the prefix is significant.
        let reply_subject_prefix = env::var("REPLY_SUBJECT_PREFIX")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_REPLY_SUBJECT_PREFIX.to_string());

        let client_state = env::var("WEBHOOK_CLIENT_STATE")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let processed_ids_path = match env::var("PROCESSED_IDS_PATH") {
            Ok(raw) => resolve_path(raw)?,
            Err(_) => default_runtime_root()?.join("state").join("processed_ids.txt"),
        };

        let worker_poll_interval = Duration::from_secs(
            env::var("WORKER_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_WORKER_POLL_INTERVAL_SECS),
        );

        let worker_concurrency = env::var("WORKER_MAX_CONCURRENCY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

        let notification_body_max_bytes = env::var("NOTIFICATION_MAX_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_NOTIFICATION_BODY_MAX_BYTES);

        Ok(Self {
            host,
            port,
            support_address,
            reply_subject_prefix,
            client_state,
            processed_ids_path,
            worker_poll_interval,
            worker_concurrency,
            notification_body_max_bytes,
        })
    }
}

fn default_runtime_root() -> Result<PathBuf, io::Error> {
    let home = env::var("HOME").map_err(|_| {
        io::Error::new(io::ErrorKind::NotFound, "HOME is not set")
    })?;
    Ok(PathBuf::from(home).join(".deflektor"))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(env::current_dir()?.join(path))
}
