//! Background watchdog: surfaces asynchronous communicator errors and
//! fans aborts out across ranks through the store.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};

use crate::group::GroupShared;
use crate::group::comm::{aborted_comm_key, check_bundle_errors};

/// Termination flag plus the condvar that interrupts the between-cycle
/// sleep when the group is being dropped.
pub(crate) struct WatchdogControl {
    pub(crate) terminate: Mutex<bool>,
    pub(crate) cv: Condvar,
}

impl WatchdogControl {
    pub(crate) fn new() -> Self {
        Self {
            terminate: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn request_stop(&self) {
        let mut terminate = self
            .terminate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *terminate = true;
        self.cv.notify_one();
    }
}

/// Watchdog loop body; runs until the control flag is raised.
///
/// Each cycle: snapshot the communicator cache and probe every bundle for
/// asynchronous errors; under blocking wait, abort errored bundles
/// (leaving them cached so a mis-sequenced retry fails loudly instead of
/// rebuilding over a half-dead group), publish the aborted ids, and
/// briefly wait on every not-yet-aborted id's store key to pick up aborts
/// initiated by peers. Failures here are logged, never propagated.
pub(crate) fn run(shared: &GroupShared) {
    tracing::debug!(rank = shared.rank, "communicator watchdog started");
    loop {
        let mut aborted_this_cycle: HashSet<String> = HashSet::new();
        let mut all_ids: HashSet<String> = HashSet::new();

        {
            let state = match shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (device_set, bundle) in &state.dev_comms {
                for comm in bundle {
                    all_ids.insert(comm.id_hex());
                }
                if let Some(err) = check_bundle_errors(bundle) {
                    tracing::info!(
                        device_set = %device_set,
                        error = %err,
                        "asynchronous error on cached communicators"
                    );
                    // Without blocking wait the caller's ordering model is
                    // "wait, then either the result is real or we hang";
                    // aborting under them would let garbage flow onward.
                    if shared.config.blocking_wait {
                        for comm in bundle {
                            comm.abort();
                            aborted_this_cycle.insert(comm.id_hex());
                        }
                    }
                }
            }
        }

        if shared.config.blocking_wait {
            for id in &aborted_this_cycle {
                {
                    let mut state = shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    state.aborted_comms.insert(id.clone());
                }
                let key = aborted_comm_key(id);
                match shared.store.set(&key, &[]) {
                    Ok(()) => {
                        tracing::info!(key, "watchdog wrote aborted communicator id to store");
                    }
                    Err(err) => {
                        tracing::warn!(key, error = %err, "watchdog failed to publish abort");
                    }
                }
            }

            let already_aborted: HashSet<String> = {
                let state = shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                state.aborted_comms.clone()
            };
            for id in all_ids.difference(&already_aborted) {
                let key = aborted_comm_key(id);
                if shared.store.wait(&[&key], shared.config.store_wait).is_ok() {
                    tracing::info!(key, "peer abort found in store, aborting local communicators");
                    let mut state = shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    match state.id_comms.get(id) {
                        Some(bundle) => {
                            for comm in bundle {
                                comm.abort();
                            }
                        }
                        None => {
                            tracing::warn!(
                                id = %id,
                                "aborted communicator id not found in cache"
                            );
                        }
                    }
                    state.aborted_comms.insert(id.clone());
                }
            }
        }

        let terminate = shared
            .watchdog
            .terminate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (terminate, _) = shared
            .watchdog
            .cv
            .wait_timeout_while(terminate, shared.config.watchdog_interval, |stop| !*stop)
            .unwrap_or_else(PoisonError::into_inner);
        if *terminate {
            break;
        }
    }
    tracing::debug!(rank = shared.rank, "communicator watchdog terminated");
}
