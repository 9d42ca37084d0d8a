//! Finished-run recording.
//!
//! The pipeline hands every finished run (completed or failed) to a
//! [`RunRecorder`]. Persistent history lives outside this crate; the
//! in-memory log backs the gateway and tests.

use crate::types::RunRecord;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// Sink for finished runs. Write-only from the pipeline's side.
pub trait RunRecorder: Send + Sync {
    fn record(&self, record: RunRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl RunRecorder for NoopRecorder {
    fn record(&self, _record: RunRecord) {}
}

/// Bounded in-memory log; the oldest record is evicted first.
pub struct InMemoryRunLog {
    records: Mutex<VecDeque<RunRecord>>,
    capacity: usize,
}

impl InMemoryRunLog {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Records, newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<RunRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRunLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl RunRecorder for InMemoryRunLog {
    fn record(&self, record: RunRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.capacity {
            records.pop_front();
        }
        tracing::debug!(run_id = %record.id, "Recorded run");
        records.push_back(record);
    }
}
