// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Global concurrency gate
//!
//! One process-wide counting semaphore bounds simultaneous backend work.
//! Head nodes limit file handles and child processes, so unbounded fan-out
//! is unsafe even when the scheduler itself could accept more jobs.
//!
//! The process-wide gate is initialised once, lazily, from the run's
//! `concurrency` setting; later `init_global` calls are ignored. Executors
//! receive the gate as an injected handle, so tests run against private
//! instances instead of resetting global state. Acquisition is fair FIFO
//! to the extent the underlying semaphore provides it.

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::{SeqflowError, SeqflowResult};

static GLOBAL: Mutex<Option<ConcurrencyGate>> = Mutex::new(None);

/// Counting semaphore limiting simultaneous backend invocations
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    /// Create a gate admitting `limit` concurrent holders (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Acquire one permit, waiting while the gate is saturated.
    ///
    /// The permit releases on drop, covering every exit path of the caller.
    pub async fn acquire(&self) -> SeqflowResult<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SeqflowError::Internal {
                message: "concurrency gate closed".into(),
            })
    }

    /// Permits currently available. Mostly useful for diagnostics.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Initialise the process-wide gate. Only the first call takes effect.
    pub fn init_global(limit: usize) {
        let mut global = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
        if global.is_none() {
            *global = Some(Self::new(limit));
        }
    }

    /// The process-wide gate, created with a limit of 1 if `init_global`
    /// has not run yet.
    pub fn global() -> Self {
        let mut global = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
        global.get_or_insert_with(|| Self::new(1)).clone()
    }
}
