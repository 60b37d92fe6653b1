//! Asynchronous completion handles for submitted collectives.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::device::{DeviceRuntime, Event};
use crate::error::{CommError, Result};
use crate::group::comm::{CommBundle, aborted_comm_key, check_bundle_errors};
use crate::store::Store;
use crate::tensor::DeviceTensor;
use crate::types::DeviceIndex;

/// Handle to one submitted collective.
///
/// Completion is tracked through one event per device, recorded on the
/// collective streams after submission. The handle keeps the communicator
/// bundle alive, captures the first asynchronous backend error it
/// observes, and owns the barrier tensors when it was returned by
/// `barrier` (forcing a device-synchronize in [`WorkHandle::synchronize`]).
pub struct WorkHandle {
    pub(crate) devices: Vec<DeviceIndex>,
    pub(crate) events: Vec<Event>,
    pub(crate) comms: CommBundle,
    pub(crate) runtime: Arc<dyn DeviceRuntime>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) started: Instant,
    pub(crate) blocking_wait: bool,
    pub(crate) timeout: Duration,
    pub(crate) busy_poll: Duration,
    pub(crate) error: Mutex<Option<CommError>>,
    pub(crate) barrier_tensors: Vec<DeviceTensor>,
}

impl WorkHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        devices: Vec<DeviceIndex>,
        events: Vec<Event>,
        comms: CommBundle,
        runtime: Arc<dyn DeviceRuntime>,
        store: Arc<dyn Store>,
        blocking_wait: bool,
        timeout: Duration,
        busy_poll: Duration,
    ) -> Self {
        Self {
            devices,
            events,
            comms,
            runtime,
            store,
            started: Instant::now(),
            blocking_wait,
            timeout,
            busy_poll,
            error: Mutex::new(None),
            barrier_tensors: Vec::new(),
        }
    }

    /// Capture the first asynchronous error reported by any of the
    /// communicators this work ran on. Later observations never replace
    /// an already-captured error.
    fn check_and_set_error(&self) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none()
            && let Some(err) = check_bundle_errors(&self.comms)
        {
            *slot = Some(err);
        }
    }

    fn captured_error(&self) -> Option<CommError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rethrow the captured error, probing the communicators first.
    fn check_and_throw(&self) -> Result<()> {
        self.check_and_set_error();
        match self.captured_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finished_device_execution(&self) -> Result<bool> {
        for event in &self.events {
            // Any query outcome other than complete / not-ready is fatal.
            if !self.runtime.query_event(*event)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether the collective has reached a terminal state: every
    /// completion event fired, or an asynchronous error was captured.
    pub fn is_completed(&self) -> Result<bool> {
        self.check_and_set_error();
        if self.captured_error().is_some() {
            return Ok(true);
        }
        self.finished_device_execution()
    }

    /// Point-in-time success probe: finished on every device with no
    /// captured or currently-reported error.
    pub fn is_success(&self) -> bool {
        if self.captured_error().is_some() || check_bundle_errors(&self.comms).is_some() {
            return false;
        }
        matches!(self.finished_device_execution(), Ok(true))
    }

    /// Order the caller's current streams after the collective, then (in
    /// blocking-wait mode) poll until completion, rethrowing captured
    /// errors and aborting + publishing to the store on timeout.
    pub fn synchronize(&self) -> Result<()> {
        for (i, device) in self.devices.iter().enumerate() {
            let current = self.runtime.current_stream(*device)?;
            self.runtime.stream_wait_event(current, self.events[i])?;
            // A barrier must also drain everything already queued on the
            // device, not just the streams the event orders.
            if !self.barrier_tensors.is_empty() {
                self.runtime.set_device(*device)?;
                self.runtime.synchronize_device(*device)?;
            }
        }

        if !self.blocking_wait {
            return Ok(());
        }

        while !self.is_completed()? {
            if self.started.elapsed() > self.timeout {
                // Abort our communicators and tell the other ranks through
                // the store before surfacing the timeout, so peers hung on
                // the same collective can unblock.
                for comm in &self.comms {
                    comm.abort();
                    let key = aborted_comm_key(&comm.id_hex());
                    match self.store.set(&key, &[]) {
                        Ok(()) => {
                            tracing::info!(key, "wrote aborted communicator id to store");
                        }
                        Err(err) => {
                            tracing::warn!(key, error = %err, "failed to publish abort");
                        }
                    }
                }
                return Err(CommError::timed_out(self.timeout));
            }
            self.check_and_throw()?;
            thread::sleep(self.busy_poll);
        }
        self.check_and_throw()
    }

    /// Same as [`WorkHandle::synchronize`]; always reports `true` because
    /// there is no abort API to race against.
    pub fn wait(&self) -> Result<bool> {
        self.synchronize()?;
        Ok(true)
    }

    /// Aborting an individual work is not supported; abort surfaces
    /// through timeouts and the watchdog instead.
    pub fn abort(&self) -> Result<()> {
        Err(CommError::unsupported("WorkHandle::abort is not implemented"))
    }
}

impl Drop for WorkHandle {
    fn drop(&mut self) {
        for event in &self.events {
            self.runtime.destroy_event(*event);
        }
    }
}
