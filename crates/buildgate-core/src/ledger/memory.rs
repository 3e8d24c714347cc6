//! In-memory run ledger.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::*;

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    events: Vec<RunEvent>,
}

#[derive(Debug, Default)]
struct LedgerState {
    runs: HashMap<String, RunEntry>,
    /// Run IDs in creation order.
    order: Vec<String>,
}

impl LedgerState {
    /// Drop the oldest finished runs until at most `keep` remain.
    /// Running runs are never dropped.
    fn prune_finished(&mut self, keep: usize) {
        let LedgerState { runs, order } = self;
        let finished: Vec<&String> = order
            .iter()
            .filter(|id| {
                runs.get(*id)
                    .is_some_and(|e| e.record.state != RunState::Running)
            })
            .collect();
        let excess = finished.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let evicted: Vec<String> = finished[..excess].iter().map(|id| (*id).clone()).collect();
        for id in &evicted {
            runs.remove(id);
        }
        order.retain(|id| runs.contains_key(id));
    }
}

/// Run ledger backed by a `HashMap<RunId, RunEntry>`.
///
/// Suitable for single-process use (the CLI, the daemon and tests). By
/// default every run is kept; a long-lived process should bound the
/// history with [`MemoryRunLedger::with_retention`].
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    state: Mutex<LedgerState>,
    /// Finished runs kept after `finish_run`; `None` keeps all of them.
    retain_finished: Option<usize>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_finished_runs` finished runs, evicting the oldest
    /// (with their events) as newer runs finish.
    pub fn with_retention(mut self, max_finished_runs: usize) -> Self {
        self.retain_finished = Some(max_finished_runs);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn running_entry<'a>(state: &'a mut LedgerState, run_id: &RunId) -> LedgerResult<&'a mut RunEntry> {
    let entry = state
        .runs
        .get_mut(&run_id.0)
        .ok_or_else(|| LedgerError::RunNotFound {
            run_id: run_id.0.clone(),
        })?;
    if entry.record.state != RunState::Running {
        return Err(LedgerError::InvalidRunState {
            run_id: run_id.0.clone(),
            state: entry.record.state.to_string(),
            expected: RunState::Running.to_string(),
        });
    }
    Ok(entry)
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(&self, metadata: RunMetadata) -> LedgerResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            metadata,
            state: RunState::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut state = self.lock();
        state.order.push(run_id.0.clone());
        state.runs.insert(
            run_id.0.clone(),
            RunEntry {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: NewRunEvent) -> LedgerResult<u64> {
        let mut state = self.lock();
        let entry = running_entry(&mut state, run_id)?;
        let seq = entry.events.len() as u64 + 1;
        entry.events.push(RunEvent {
            seq,
            kind: event.kind,
            pipeline: event.pipeline,
            stage: event.stage,
            payload: event.payload,
            timestamp: Utc::now(),
        });
        Ok(seq)
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        final_state: RunState,
        summary: RunSummary,
    ) -> LedgerResult<()> {
        if final_state == RunState::Running {
            return Err(LedgerError::InvalidRunState {
                run_id: run_id.0.clone(),
                state: final_state.to_string(),
                expected: "a terminal state".to_string(),
            });
        }
        let mut state = self.lock();
        let entry = running_entry(&mut state, run_id)?;
        entry.record.state = final_state;
        entry.record.summary = Some(summary);
        entry.record.completed_at = Some(Utc::now());
        if let Some(keep) = self.retain_finished {
            state.prune_finished(keep);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> LedgerResult<RunRecord> {
        let state = self.lock();
        state
            .runs
            .get(&run_id.0)
            .map(|e| e.record.clone())
            .ok_or_else(|| LedgerError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> LedgerResult<Vec<RunEvent>> {
        let state = self.lock();
        let entry = state
            .runs
            .get(&run_id.0)
            .ok_or_else(|| LedgerError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        Ok(entry.events.clone())
    }

    async fn list_runs(&self, run_key: Option<&RunKey>) -> LedgerResult<Vec<RunRecord>> {
        let state = self.lock();
        let records = state
            .order
            .iter()
            .filter_map(|id| state.runs.get(id))
            .filter(|e| run_key.map(|k| e.record.metadata.run_key == *k).unwrap_or(true))
            .map(|e| e.record.clone())
            .collect();
        Ok(records)
    }
}
