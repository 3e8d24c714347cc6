//! Per-run-key concurrency control.
//!
//! At most one run owns a [`RunKey`] at a time. Acquiring a key that is
//! already owned revokes the previous owner's token; the previous run notices
//! at its next stage boundary and ends as cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use buildgate_core::obs;
use buildgate_core::RunKey;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Slot {
    generation: u64,
    token: CancellationToken,
}

type Slots = Arc<Mutex<HashMap<RunKey, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<RunKey, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps each run key to its single active lease.
///
/// Cloning shares the same slot table.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGovernor {
    slots: Slots,
    next_generation: Arc<AtomicU64>,
}

impl ConcurrencyGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `key`, revoking whichever lease held it before.
    pub fn acquire(&self, key: RunKey) -> RunLease {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();

        let previous = lock(&self.slots).insert(
            key.clone(),
            Slot {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            obs::emit_run_superseded(&key, previous.generation);
        }

        RunLease {
            key,
            generation,
            token,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Whether some run currently owns `key`.
    pub fn is_active(&self, key: &RunKey) -> bool {
        lock(&self.slots).contains_key(key)
    }

    /// Number of keys with an active lease.
    pub fn active_count(&self) -> usize {
        lock(&self.slots).len()
    }
}

/// Ownership of a run key. Releases the key on drop unless superseded.
#[derive(Debug)]
pub struct RunLease {
    key: RunKey,
    generation: u64,
    token: CancellationToken,
    slots: Slots,
}

impl RunLease {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token cancelled when a newer run supersedes this one.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_revoked(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        // A superseded lease must not evict its successor.
        if slots.get(&self.key).map(|s| s.generation) == Some(self.generation) {
            slots.remove(&self.key);
        }
    }
}
