//! Runner allocation for new applications
//!
//! [`allocate`] is the placement rule: the first runner, in registration order,
//! whose current load is below its capacity. [`Allocator`] wraps it with a
//! reservation ledger so that concurrent creations cannot oversubscribe a runner
//! while their creation requests are still in flight.

use crate::cluster::{Cluster, Runner};
use crate::routes::{load_on, RoutingTable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pick the first runner whose load is below its capacity.
///
/// First eligible wins even if a later runner is less loaded.
pub fn allocate<F>(runners: &[Runner], mut current_load: F) -> Option<&Runner>
where
    F: FnMut(&Runner) -> usize,
{
    runners.iter().find(|runner| current_load(runner) < runner.max_apps)
}

type Ledger = Arc<Mutex<HashMap<String, usize>>>;

/// Places new apps on runners, counting both routed apps and in-flight creations
pub struct Allocator {
    cluster: Arc<Cluster>,
    routes: Arc<RoutingTable>,
    pending: Ledger,
}

impl Allocator {
    pub fn new(cluster: Arc<Cluster>, routes: Arc<RoutingTable>) -> Self {
        Self {
            cluster,
            routes,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Choose a runner for a new app and hold a slot on it.
    ///
    /// Returns `None` when every runner is full. The slot is released when the
    /// returned [`Reservation`] is dropped.
    pub fn reserve(&self) -> Option<Reservation> {
        let runners = self.cluster.list();
        let mut pending = self.pending.lock();
        let snapshot = self.routes.all();

        let chosen = allocate(&runners, |runner| {
            load_on(&snapshot, runner) + pending.get(&runner.id).copied().unwrap_or(0)
        })
        .cloned();

        match chosen {
            Some(runner) => {
                *pending.entry(runner.id.clone()).or_insert(0) += 1;
                debug!(runner = %runner.id, url = %runner.url, "Reserved capacity for new app");
                Some(Reservation {
                    runner,
                    pending: Arc::clone(&self.pending),
                })
            }
            None => {
                warn!(
                    runners = runners.len(),
                    "There are no app runner instances available! Add another instance or change the maxApps value of an existing one."
                );
                None
            }
        }
    }

    /// Number of creations currently in flight against a runner
    pub fn pending(&self, runner_id: &str) -> usize {
        self.pending.lock().get(runner_id).copied().unwrap_or(0)
    }
}

/// A held capacity slot on a runner.
///
/// Drop it only after any resulting route entry has been written, so the load
/// seen by other allocations never dips in between.
#[derive(Debug)]
pub struct Reservation {
    runner: Runner,
    pending: Ledger,
}

impl Reservation {
    pub fn runner(&self) -> &Runner {
        &self.runner
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if let Some(count) = pending.get_mut(&self.runner.id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(&self.runner.id);
            }
        }
    }
}
