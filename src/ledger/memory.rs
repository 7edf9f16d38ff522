use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::ledger::{
    HistoryRecord, JobId, JobLedger, LedgerEntry, LedgerError, LedgerResult, LedgerStatus,
    NewLedgerEntry,
};

#[derive(Debug, Default)]
struct LedgerState {
    jobs: BTreeMap<JobId, LedgerEntry>,
    history: Vec<HistoryRecord>,
    next_history_id: u64,
}

impl LedgerState {
    fn record_history(&mut self, entry: &LedgerEntry) {
        self.next_history_id += 1;
        self.history.push(HistoryRecord {
            history_id: self.next_history_id,
            entry: entry.clone(),
        });
    }

    fn entry_mut(&mut self, job_id: JobId) -> LedgerResult<&mut LedgerEntry> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(LedgerError::NotFound(job_id))
    }
}

/// Ledger kept in process memory.
///
/// Used for `schedule-once` dry runs and by the test suite.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// All entries, ordered by job id.
    pub fn all(&self) -> Vec<LedgerEntry> {
        self.lock().jobs.values().cloned().collect()
    }
}

impl JobLedger for MemoryLedger {
    fn insert(&self, new: NewLedgerEntry) -> LedgerResult<LedgerEntry> {
        let mut state = self.lock();
        if state.jobs.contains_key(&new.job_id) {
            return Err(LedgerError::AlreadyExists(new.job_id));
        }
        let entry = LedgerEntry::from_new(new, Utc::now());
        state.jobs.insert(entry.job_id, entry.clone());
        state.record_history(&entry);
        Ok(entry)
    }

    fn get(&self, job_id: JobId) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    fn set_status(&self, job_id: JobId, status: LedgerStatus) -> LedgerResult<LedgerEntry> {
        let mut state = self.lock();
        let entry = state.entry_mut(job_id)?;
        entry.status = status;
        entry.last_update = Utc::now();
        let snapshot = entry.clone();
        state.record_history(&snapshot);
        Ok(snapshot)
    }

    fn set_backend_id(&self, job_id: JobId, backend_id: &str) -> LedgerResult<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(job_id)?;
        entry.backend_id = backend_id.to_string();
        Ok(())
    }

    fn set_error(&self, job_id: JobId, message: &str) -> LedgerResult<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(job_id)?;
        entry.error_message = message.to_string();
        Ok(())
    }

    fn jobs_by_status(&self, status: LedgerStatus) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    fn count_by_status_and_endpoint(
        &self,
        status: LedgerStatus,
        endpoint_address: &str,
    ) -> LedgerResult<usize> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|e| e.status == status && e.endpoint_address == endpoint_address)
            .count())
    }

    fn history(&self, job_id: JobId) -> LedgerResult<Vec<HistoryRecord>> {
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|h| h.entry.job_id == job_id)
            .cloned()
            .collect())
    }
}
