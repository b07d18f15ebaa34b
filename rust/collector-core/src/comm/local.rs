// rust/collector-core/src/comm/local.rs

//! In-process communicator group.
//!
//! `LocalGroup` lets several threads of one process act as the ranks of a
//! collective group. It is used to run multi-rank scenarios without an MPI
//! launcher, e.g. in tests.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::traits::Communicator;
use crate::error::{CollectorError, Result};

const GROUP_NAME: &str = "<local-group>";

fn poisoned() -> CollectorError {
    CollectorError::backend(GROUP_NAME, "peer process failed (poisoned rendezvous)")
}

/// Outcome of one completed collective round.
type RoundResult = std::result::Result<Arc<Vec<u64>>, String>;

#[derive(Debug)]
struct Rendezvous {
    /// Number of completed rounds.
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u64>>>,
    published: Option<RoundResult>,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<Rendezvous>,
    round_done: Condvar,
}

/// Factory for a group of [`LocalCommunicator`]s sharing one rendezvous.
#[derive(Debug)]
pub struct LocalGroup;

impl LocalGroup {
    /// Creates `size` communicators, one per rank, in rank order.
    ///
    /// Each communicator is moved to the thread that plays that rank.
    pub fn new(size: usize) -> Vec<LocalCommunicator> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(Rendezvous {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: None,
            }),
            round_done: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of a [`LocalGroup`].
#[derive(Debug)]
pub struct LocalCommunicator {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalCommunicator {
    fn lock(&self) -> Result<MutexGuard<'_, Rendezvous>> {
        self.shared.state.lock().map_err(|_| poisoned())
    }

    /// Completes the round as the last arriving rank.
    fn publish(&self, state: &mut Rendezvous) -> RoundResult {
        let slots = std::mem::replace(&mut state.slots, vec![None; self.shared.size]);
        let expected = slots.first().and_then(|s| s.as_ref()).map_or(0, Vec::len);

        let result = if slots
            .iter()
            .any(|slot| slot.as_ref().map_or(true, |v| v.len() != expected))
        {
            Err(format!(
                "all_gather contributions differ in length (expected {expected} values per rank)"
            ))
        } else {
            Ok(Arc::new(slots.into_iter().flatten().flatten().collect()))
        };

        state.published = Some(result.clone());
        state.arrived = 0;
        state.generation += 1;
        self.shared.round_done.notify_all();
        result
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> u64 {
        self.rank as u64
    }

    fn size(&self) -> u64 {
        self.shared.size as u64
    }

    fn all_gather(&self, local: &[u64]) -> Result<Vec<u64>> {
        let mut state = self.lock()?;
        state.slots[self.rank] = Some(local.to_vec());
        state.arrived += 1;

        let outcome = if state.arrived == self.shared.size {
            self.publish(&mut state)
        } else {
            // The next round cannot complete before this rank joins it, so the
            // published result is still ours when we wake up.
            let round = state.generation;
            while state.generation == round {
                state = self.shared.round_done.wait(state).map_err(|_| poisoned())?;
            }
            state
                .published
                .clone()
                .unwrap_or_else(|| Err("collective round finished without a result".to_string()))
        };

        outcome
            .map(|values| values.as_ref().clone())
            .map_err(|message| CollectorError::backend(GROUP_NAME, message))
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather(&[]).map(|_| ())
    }
}
