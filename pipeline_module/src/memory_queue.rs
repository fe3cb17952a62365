//! In-memory work queue for tests and single-process setups.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use crate::task::EmailTask;
use crate::work_queue::{ReceivedTask, WorkQueue, WorkQueueError};

/// A delivery set aside after processing failed permanently.
#[derive(Debug, Clone)]
pub struct DeadLetteredTask {
    pub raw: String,
    pub reason: String,
}

/// Queue state lives entirely in process memory; nothing survives a
/// restart, which is fine for the tests and dev loops this backs.
#[derive(Default)]
pub struct MemoryWorkQueue {
    ready: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<Uuid, String>>,
    dead: Mutex<Vec<DeadLetteredTask>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body directly, bypassing task serialization.
    pub fn push_raw(&self, raw: impl Into<String>) {
        self.ready
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push_back(raw.into());
    }

    pub fn ready_len(&self) -> usize {
        self.ready
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetteredTask> {
        self.dead
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl WorkQueue for MemoryWorkQueue {
    fn publish(&self, task: &EmailTask) -> Result<(), WorkQueueError> {
        let raw = serde_json::to_string(task)?;
        self.ready
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push_back(raw);
        Ok(())
    }

    fn receive(&self) -> Result<Option<ReceivedTask>, WorkQueueError> {
        let next = self
            .ready
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .pop_front();
        let Some(raw) = next else {
            return Ok(None);
        };
        let id = Uuid::new_v4();
        self.in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(id, raw.clone());
        Ok(Some(ReceivedTask { id, raw }))
    }

    fn complete(&self, id: &Uuid) -> Result<(), WorkQueueError> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or(WorkQueueError::UnknownDelivery(*id))
    }

    fn dead_letter(&self, id: &Uuid, reason: &str) -> Result<(), WorkQueueError> {
        let raw = self
            .in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(id)
            .ok_or(WorkQueueError::UnknownDelivery(*id))?;
        self.dead
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(DeadLetteredTask {
                raw,
                reason: reason.to_string(),
            });
        Ok(())
    }
}
