//! Queue consumers that turn reply tasks into outbound replies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{error, info, warn};
use uuid::Uuid;

use directory_module::{DirectoryClient, ReplyMessage};

use crate::elaborate::ElaborationEngine;
use crate::service::ServiceConfig;
use crate::task::EmailTask;
use crate::work_queue::WorkQueue;

/// Where a delivery ended up after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Reply sent and the delivery acknowledged.
    Completed,
    /// Task id was already processed; acknowledged without a reply.
    Duplicate,
    /// Delivery moved to the dead-letter queue.
    DeadLettered(DeadLetterReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Body was empty or not a valid task.
    MalformedBody,
    /// Task carried no recipient address.
    MissingRecipient,
    /// Recipient did not resolve to a directory user.
    UnknownRecipient,
    /// The reply could not be delivered.
    SendFailed,
}

impl DeadLetterReason {
    pub fn label(self) -> &'static str {
        match self {
            DeadLetterReason::MalformedBody => "malformed_body",
            DeadLetterReason::MissingRecipient => "missing_recipient",
            DeadLetterReason::UnknownRecipient => "unknown_recipient",
            DeadLetterReason::SendFailed => "send_failed",
        }
    }
}

pub struct WorkerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub fn spawn_worker_threads(
    config: Arc<ServiceConfig>,
    queue: Arc<dyn WorkQueue>,
    directory: Arc<dyn DirectoryClient>,
    engine: Arc<dyn ElaborationEngine>,
) -> Result<WorkerControl, std::io::Error> {
    let store = Arc::new(Mutex::new(ProcessedTaskStore::load(
        &config.processed_ids_path,
    )?));
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(config.worker_concurrency);

    for index in 0..config.worker_concurrency {
        let config = config.clone();
        let queue = queue.clone();
        let directory = directory.clone();
        let engine = engine.clone();
        let store = store.clone();
        let stop = stop.clone();
        let handle = thread::spawn(move || {
            info!("task worker {} started", index);
            while !stop.load(Ordering::Relaxed) {
                match queue.receive() {
                    Ok(Some(delivery)) => {
                        let outcome = process_delivery(
                            &config,
                            directory.as_ref(),
                            engine.as_ref(),
                            &store,
                            &delivery.raw,
                        );
                        settle_delivery(queue.as_ref(), &delivery.id, outcome);
                    }
                    Ok(None) => {
                        thread::sleep(config.worker_poll_interval);
                    }
                    Err(err) => {
                        warn!("work queue receive error: {}", err);
                        thread::sleep(config.worker_poll_interval);
                    }
                }
            }
            info!("task worker {} stopped", index);
        });
        handles.push(handle);
    }

    Ok(WorkerControl { stop, handles })
}

/// Runs one delivery through validate, dedupe, elaborate and reply.
///
/// The caller settles the delivery on the queue according to the
/// returned outcome; this function never touches the queue itself.
pub fn process_delivery(
    config: &ServiceConfig,
    directory: &dyn DirectoryClient,
    engine: &dyn ElaborationEngine,
    store: &Mutex<ProcessedTaskStore>,
    raw: &str,
) -> TaskOutcome {
    let task: EmailTask = match serde_json::from_str(raw) {
        Ok(task) => task,
        Err(err) => {
            warn!("discarding malformed task payload: {}", err);
            return TaskOutcome::DeadLettered(DeadLetterReason::MalformedBody);
        }
    };

    let is_new = {
        let mut store = store.lock().unwrap_or_else(|poison| poison.into_inner());
        match store.mark_if_new(&task.email_id) {
            Ok(value) => value,
            Err(err) => {
                error!("processed task store error: {}", err);
                true
            }
        }
    };
    if !is_new {
        info!("task {} already processed, completing without reply", task.email_id);
        return TaskOutcome::Duplicate;
    }

    let draft = engine.elaborate(task.body.as_deref().unwrap_or(""));

    let recipient = task.recipient.as_deref().map(str::trim).unwrap_or("");
    if recipient.is_empty() {
        warn!("task {} has no recipient", task.email_id);
        return TaskOutcome::DeadLettered(DeadLetterReason::MissingRecipient);
    }

    let user_id = match directory.resolve_user_id(recipient) {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(
                "no directory user for {} on task {}",
                recipient, task.email_id
            );
            return TaskOutcome::DeadLettered(DeadLetterReason::UnknownRecipient);
        }
        Err(err) => {
            warn!("recipient lookup failed for task {}: {}", task.email_id, err);
            return TaskOutcome::DeadLettered(DeadLetterReason::UnknownRecipient);
        }
    };

    let reply = ReplyMessage {
        subject: format!(
            "{}{}",
            config.reply_subject_prefix,
            task.subject.as_deref().unwrap_or("")
        ),
        body_text: draft.text,
        recipient: recipient.to_string(),
    };
    match directory.send_reply(&user_id, &task.email_id, &reply) {
        Ok(()) => {
            info!("replied to {} for task {}", recipient, task.email_id);
            TaskOutcome::Completed
        }
        Err(err) => {
            error!("reply send failed for task {}: {}", task.email_id, err);
            TaskOutcome::DeadLettered(DeadLetterReason::SendFailed)
        }
    }
}

fn settle_delivery(queue: &dyn WorkQueue, id: &Uuid, outcome: TaskOutcome) {
    let result = match outcome {
        TaskOutcome::Completed | TaskOutcome::Duplicate => queue.complete(id),
        TaskOutcome::DeadLettered(reason) => queue.dead_letter(id, reason.label()),
    };
    if let Err(err) = result {
        warn!("failed to settle delivery {}: {}", id, err);
    }
}

/// File-backed set of task ids whose processing has been attempted.
///
/// Ids live one per line and are appended when first seen, before the
/// outcome of the attempt is known, so restarts keep the set and a
/// redelivered task completes without a second attempt.
pub struct ProcessedTaskStore {
    path: PathBuf,
    seen: HashSet<String>,
}

impl ProcessedTaskStore {
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut seen = HashSet::new();
        if path.exists() {
            for raw in std::fs::read_to_string(path)?.lines() {
                let line = raw.trim();
                if !line.is_empty() {
                    seen.insert(line.to_string());
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            seen,
        })
    }

    /// Records `id` and reports whether it was new. Blank ids pass as new.
    pub fn mark_if_new(&mut self, id: &str) -> Result<bool, std::io::Error> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(true);
        }
        if self.seen.contains(id) {
            return Ok(false);
        }

        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        use std::io::Write;
        writeln!(handle, "{}", id)?;
        self.seen.insert(id.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use directory_module::{DirectoryError, FetchedMessage};

    use crate::elaborate::ElaborationResult;
    use crate::memory_queue::MemoryWorkQueue;
    use crate::service::DEFAULT_NOTIFICATION_BODY_MAX_BYTES;

    use super::*;

    struct StaticEngine {
        result: ElaborationResult,
        calls: Mutex<u32>,
    }

    impl StaticEngine {
        fn new(subject: &str, text: &str) -> Self {
            Self {
                result: ElaborationResult {
                    subject: subject.to_string(),
                    text: text.to_string(),
                },
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl ElaborationEngine for StaticEngine {
        fn elaborate(&self, _email_text: &str) -> ElaborationResult {
            *self.calls.lock().unwrap() += 1;
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct RecordingDirectory {
        user_ids: HashMap<String, String>,
        fail_resolve: bool,
        fail_send: bool,
        resolve_calls: Mutex<u32>,
        sent: Mutex<Vec<(String, String, ReplyMessage)>>,
    }

    impl RecordingDirectory {
        fn with_user(address: &str, user_id: &str) -> Self {
            Self {
                user_ids: HashMap::from([(address.to_string(), user_id.to_string())]),
                ..Self::default()
            }
        }

        fn resolve_calls(&self) -> u32 {
            *self.resolve_calls.lock().unwrap()
        }

        fn sent(&self) -> Vec<(String, String, ReplyMessage)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl DirectoryClient for RecordingDirectory {
        fn fetch_message_by_id(
            &self,
            _message_id: &str,
        ) -> Result<Option<FetchedMessage>, DirectoryError> {
            Ok(None)
        }

        fn resolve_user_id(&self, address: &str) -> Result<Option<String>, DirectoryError> {
            *self.resolve_calls.lock().unwrap() += 1;
            if self.fail_resolve {
                return Err(DirectoryError::Api {
                    status: 503,
                    body: "down".to_string(),
                });
            }
            Ok(self.user_ids.get(address).cloned())
        }

        fn send_reply(
            &self,
            user_id: &str,
            message_id: &str,
            reply: &ReplyMessage,
        ) -> Result<(), DirectoryError> {
            if self.fail_send {
                return Err(DirectoryError::Api {
                    status: 500,
                    body: "smtp down".to_string(),
                });
            }
            self.sent.lock().unwrap().push((
                user_id.to_string(),
                message_id.to_string(),
                reply.clone(),
            ));
            Ok(())
        }
    }

    fn test_config(temp: &TempDir) -> ServiceConfig {
        ServiceConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            support_address: "support@test.local".to_string(),
            reply_subject_prefix: "Re from Deflektor: ".to_string(),
            client_state: None,
            processed_ids_path: temp.path().join("state").join("processed_ids.txt"),
            worker_poll_interval: Duration::from_millis(10),
            worker_concurrency: 1,
            notification_body_max_bytes: DEFAULT_NOTIFICATION_BODY_MAX_BYTES,
        }
    }

    fn test_store(config: &ServiceConfig) -> Mutex<ProcessedTaskStore> {
        Mutex::new(ProcessedTaskStore::load(&config.processed_ids_path).expect("store"))
    }

    fn sample_raw() -> String {
        serde_json::to_string(&EmailTask {
            email_id: "m1".to_string(),
            subject: Some("Help".to_string()),
            body: Some("printer broken".to_string()),
            sender: Some("a@x.com".to_string()),
            recipient: Some("b@x.com".to_string()),
        })
        .expect("serialize")
    }

    #[test]
    fn completed_reply_combines_prefix_and_engine_text() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::with_user("b@x.com", "uid-1");
        let engine = StaticEngine::new("Support Request Received", "Try restarting the printer.");
        let store = test_store(&config);

        let outcome = process_delivery(&config, &directory, &engine, &store, &sample_raw());
        assert_eq!(outcome, TaskOutcome::Completed);

        let sent = directory.sent();
        assert_eq!(sent.len(), 1);
        let (user_id, message_id, reply) = &sent[0];
        assert_eq!(user_id, "uid-1");
        assert_eq!(message_id, "m1");
        assert_eq!(reply.subject, "Re from Deflektor: Help");
        assert_eq!(reply.body_text, "Try restarting the printer.");
        assert_eq!(reply.recipient, "b@x.com");
    }

    #[test]
    fn redelivered_task_completes_without_second_reply() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::with_user("b@x.com", "uid-1");
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        let first = process_delivery(&config, &directory, &engine, &store, &sample_raw());
        let second = process_delivery(&config, &directory, &engine, &store, &sample_raw());
        assert_eq!(first, TaskOutcome::Completed);
        assert_eq!(second, TaskOutcome::Duplicate);
        assert_eq!(engine.calls(), 1);
        assert_eq!(directory.sent().len(), 1);
    }

    #[test]
    fn processed_ids_survive_a_restart() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::with_user("b@x.com", "uid-1");
        let engine = StaticEngine::new("s", "t");

        let store = test_store(&config);
        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, &sample_raw()),
            TaskOutcome::Completed
        );
        drop(store);

        let reloaded = test_store(&config);
        assert_eq!(
            process_delivery(&config, &directory, &engine, &reloaded, &sample_raw()),
            TaskOutcome::Duplicate
        );
        assert_eq!(directory.sent().len(), 1);
    }

    #[test]
    fn malformed_body_is_dead_lettered() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::default();
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        for raw in ["", "not json", r#"{"subject":"no id"}"#] {
            assert_eq!(
                process_delivery(&config, &directory, &engine, &store, raw),
                TaskOutcome::DeadLettered(DeadLetterReason::MalformedBody)
            );
        }
        assert_eq!(engine.calls(), 0);
        assert_eq!(directory.resolve_calls(), 0);
    }

    #[test]
    fn missing_recipient_dead_letters_before_lookup() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::default();
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        let raw = r#"{"emailId":"m2","subject":"Help","body":"b","sender":"a@x.com","recipient":"   "}"#;
        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, raw),
            TaskOutcome::DeadLettered(DeadLetterReason::MissingRecipient)
        );
        let no_recipient = r#"{"emailId":"m3","subject":"Help"}"#;
        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, no_recipient),
            TaskOutcome::DeadLettered(DeadLetterReason::MissingRecipient)
        );
        assert_eq!(directory.resolve_calls(), 0);
    }

    #[test]
    fn unresolved_recipient_is_dead_lettered() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::default();
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, &sample_raw()),
            TaskOutcome::DeadLettered(DeadLetterReason::UnknownRecipient)
        );
    }

    #[test]
    fn dead_lettered_attempt_still_records_the_task_id() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::default();
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, &sample_raw()),
            TaskOutcome::DeadLettered(DeadLetterReason::UnknownRecipient)
        );
        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, &sample_raw()),
            TaskOutcome::Duplicate
        );
        assert_eq!(directory.resolve_calls(), 1);
    }

    #[test]
    fn lookup_failure_is_dead_lettered() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory {
            fail_resolve: true,
            ..RecordingDirectory::default()
        };
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, &sample_raw()),
            TaskOutcome::DeadLettered(DeadLetterReason::UnknownRecipient)
        );
    }

    #[test]
    fn send_failure_is_dead_lettered() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory {
            user_ids: HashMap::from([("b@x.com".to_string(), "uid-1".to_string())]),
            fail_send: true,
            ..RecordingDirectory::default()
        };
        let engine = StaticEngine::new("s", "t");
        let store = test_store(&config);

        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, &sample_raw()),
            TaskOutcome::DeadLettered(DeadLetterReason::SendFailed)
        );
    }

    #[test]
    fn missing_subject_still_gets_prefixed_reply() {
        let temp = TempDir::new().expect("tempdir");
        let config = test_config(&temp);
        let directory = RecordingDirectory::with_user("b@x.com", "uid-1");
        let engine = StaticEngine::new("s", "fallback text");
        let store = test_store(&config);

        let raw = r#"{"emailId":"m4","body":"hello","recipient":"b@x.com"}"#;
        assert_eq!(
            process_delivery(&config, &directory, &engine, &store, raw),
            TaskOutcome::Completed
        );
        assert_eq!(directory.sent()[0].2.subject, "Re from Deflektor: ");
    }

    #[test]
    fn stop_and_join_returns_quickly() {
        let temp = TempDir::new().expect("tempdir");
        let config = Arc::new(test_config(&temp));
        let queue: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new());
        let directory: Arc<dyn DirectoryClient> = Arc::new(RecordingDirectory::default());
        let engine: Arc<dyn ElaborationEngine> = Arc::new(StaticEngine::new("s", "t"));

        let start = Instant::now();
        let mut control =
            spawn_worker_threads(config, queue, directory, engine).expect("spawn workers");
        control.stop_and_join();

        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_secs(1),
            "stop_and_join took too long: {:?}",
            elapsed
        );
    }

    #[test]
    fn worker_threads_drain_the_queue() {
        let temp = TempDir::new().expect("tempdir");
        let config = Arc::new(test_config(&temp));
        let queue = Arc::new(MemoryWorkQueue::new());
        queue.push_raw(sample_raw());
        queue.push_raw("not json");

        let directory = Arc::new(RecordingDirectory::with_user("b@x.com", "uid-1"));
        let engine: Arc<dyn ElaborationEngine> = Arc::new(StaticEngine::new("s", "t"));

        let mut control = spawn_worker_threads(
            config,
            queue.clone(),
            directory.clone(),
            engine,
        )
        .expect("spawn workers");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if directory.sent().len() == 1 && queue.dead_letters().len() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        control.stop_and_join();

        assert_eq!(directory.sent().len(), 1);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "malformed_body");
        assert_eq!(queue.ready_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }
}
