//! Durable work queue contract for reply tasks.

use std::env;
use std::sync::Arc;

use uuid::Uuid;

use crate::memory_queue::MemoryWorkQueue;
use crate::service_bus_queue::ServiceBusWorkQueue;
use crate::task::EmailTask;

#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    #[error("service bus error: {0}")]
    ServiceBus(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown delivery: {0}")]
    UnknownDelivery(Uuid),
    #[error("work queue config error: {0}")]
    Config(String),
}

/// A delivery claimed from the queue, locked until settled.
#[derive(Debug, Clone)]
pub struct ReceivedTask {
    /// Handle used to complete or dead-letter this delivery.
    pub id: Uuid,
    /// Raw JSON body exactly as it arrived on the queue.
    pub raw: String,
}

/// At-least-once queue of pending reply tasks.
///
/// A received delivery stays locked until `complete` or `dead_letter`
/// settles it; unsettled deliveries become visible again once the broker
/// lock lapses, so consumers must tolerate redelivery.
pub trait WorkQueue: Send + Sync {
    fn publish(&self, task: &EmailTask) -> Result<(), WorkQueueError>;
    fn receive(&self) -> Result<Option<ReceivedTask>, WorkQueueError>;
    fn complete(&self, id: &Uuid) -> Result<(), WorkQueueError>;
    fn dead_letter(&self, id: &Uuid, reason: &str) -> Result<(), WorkQueueError>;
}

pub fn resolve_work_queue_backend() -> String {
    env::var("WORK_QUEUE_BACKEND")
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "servicebus".to_string())
}

pub fn build_queue_from_env() -> Result<Arc<dyn WorkQueue>, WorkQueueError> {
    match resolve_work_queue_backend().as_str() {
        "servicebus" => Ok(Arc::new(ServiceBusWorkQueue::from_env()?)),
        "memory" => Ok(Arc::new(MemoryWorkQueue::new())),
        other => Err(WorkQueueError::Config(format!(
            "unknown work queue backend: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            env::set_var(key, value);
            Self { key, previous }
        }

        fn clear(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            env::remove_var(key);
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn backend_defaults_to_service_bus() {
        let _lock = ENV_MUTEX
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let _backend = EnvGuard::clear("WORK_QUEUE_BACKEND");
        assert_eq!(resolve_work_queue_backend(), "servicebus");
    }

    #[test]
    fn backend_is_trimmed_and_lowercased() {
        let _lock = ENV_MUTEX
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let _backend = EnvGuard::set("WORK_QUEUE_BACKEND", "  Memory ");
        assert_eq!(resolve_work_queue_backend(), "memory");
    }

    #[test]
    fn memory_backend_builds_without_broker_config() -> Result<(), WorkQueueError> {
        let _lock = ENV_MUTEX
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let _backend = EnvGuard::set("WORK_QUEUE_BACKEND", "memory");
        let queue = build_queue_from_env()?;
        assert!(queue.receive()?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let _lock = ENV_MUTEX
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let _backend = EnvGuard::set("WORK_QUEUE_BACKEND", "carrier-pigeon");
        assert!(matches!(
            build_queue_from_env(),
            Err(WorkQueueError::Config(_))
        ));
    }
}
