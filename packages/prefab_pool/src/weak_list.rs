use std::collections::HashMap;

use foldhash::fast::RandomState;

use crate::{InstanceId, Liveness};

/// A set of weakly observed instances, keyed by identity.
///
/// Renting the same instance again replaces its observer instead of adding a second one, so
/// reuse never inflates the alive count. Dead observers are removed by [`sweep`], which also
/// runs on its own whenever the list has doubled since the previous sweep.
///
/// [`sweep`]: WeakList::sweep
#[derive(Debug)]
pub(crate) struct WeakList {
    observed: HashMap<InstanceId, Liveness, RandomState>,
    sweep_at: usize,
}

const MIN_SWEEP_AT: usize = 64;

impl WeakList {
    pub(crate) fn new() -> Self {
        Self {
            observed: HashMap::default(),
            sweep_at: MIN_SWEEP_AT,
        }
    }

    pub(crate) fn observe(&mut self, id: InstanceId, liveness: Liveness) {
        self.observed.insert(id, liveness);

        if self.observed.len() >= self.sweep_at {
            self.sweep();
        }
    }

    /// Drops observers whose instance no longer exists.
    pub(crate) fn sweep(&mut self) {
        self.observed.retain(|_, liveness| liveness.is_alive());
        self.sweep_at = self.observed.len().saturating_mul(2).max(MIN_SWEEP_AT);
    }

    /// Number of observed instances that are still alive.
    pub(crate) fn alive_count(&self) -> usize {
        self.observed
            .values()
            .filter(|liveness| liveness.is_alive())
            .count()
    }

    /// Number of observers, including any whose instance died since the last sweep.
    pub(crate) fn len(&self) -> usize {
        self.observed.len()
    }
}

impl Default for WeakList {
    fn default() -> Self {
        Self::new()
    }
}
