//! Worker pool internals.
//!
//! Each worker owns one potential runner invocation. The per-worker mutex
//! guards the state tag and the three request slots; the semaphore is how
//! a queued start request wakes the worker loop. Only the worker's own loop
//! and the handle it passes to its runner ever move the state tag, so
//! transitions stay single-writer.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use tokio::sync::{Mutex, Semaphore};

// Layer 3: Internal module imports
use super::runner::RunRequest;
use crate::rpc::{Completion, ErrorCode};

/// Lifecycle tag of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a start request.
    Idle,
    /// A start request is assigned; the runner has not reported init yet.
    Starting,
    /// The runner reported successful init.
    Running,
    /// An abort was requested; the runner is expected to return soon.
    Aborting,
    /// Init reporting failed; parked until the runner returns.
    Failed,
    /// Worker 0 only: probing the boot record before first idle.
    AutoBoot,
}

/// A start request parked on a worker.
pub(crate) struct StartContext {
    pub request: RunRequest,
    /// `None` for synthetic starts (AutoBoot), which answer nobody.
    pub completion: Option<Completion>,
}

/// An abort/callback request queued for the worker's next cooperation
/// point.
pub(crate) struct PendingRequest {
    pub name: String,
    pub completion: Completion,
}

pub(crate) struct WorkerInner {
    pub state: WorkerState,
    /// Holds a start request exactly while `state` is Starting or Running.
    pub start: Option<StartContext>,
    pub pending: Option<PendingRequest>,
    /// Parked long-poll continuation, answered when the runner returns.
    pub callback: Option<Completion>,
}

/// One slot of the fixed worker pool.
pub struct Worker {
    index: u8,
    inner: Mutex<WorkerInner>,
    wakeup: Semaphore,
}

impl Worker {
    pub(crate) fn new(index: u8) -> Arc<Self> {
        Arc::new(Self {
            index,
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Idle,
                start: None,
                pending: None,
                callback: None,
            }),
            wakeup: Semaphore::new(0),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub(crate) fn inner(&self) -> &Mutex<WorkerInner> {
        &self.inner
    }

    /// Current state tag.
    pub async fn state(&self) -> WorkerState {
        self.inner.lock().await.state
    }

    /// Assigns a start request to this worker if it is idle.
    ///
    /// The slot moves atomically to `Starting` so a concurrent scan cannot
    /// claim the same worker twice.
    pub(crate) async fn try_assign(
        &self,
        request: RunRequest,
        completion: &mut Option<Completion>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != WorkerState::Idle || inner.start.is_some() {
            return false;
        }
        inner.state = WorkerState::Starting;
        inner.start = Some(StartContext {
            request,
            completion: completion.take(),
        });
        drop(inner);
        self.wakeup.add_permits(1);
        true
    }

    /// Posts an abort/callback request for the runner's next cooperation
    /// point. Fails busy while a previous request is still unprocessed.
    pub(crate) async fn post_request(
        &self,
        name: String,
        completion: &mut Option<Completion>,
    ) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock().await;
        if inner.pending.is_some() {
            return Err(ErrorCode::BUSY);
        }
        let Some(completion) = completion.take() else {
            return Err(ErrorCode::INTERNAL_ERROR);
        };
        inner.pending = Some(PendingRequest { name, completion });
        Ok(())
    }

    /// Parks the loop until a start request arrives. Returns `false` when
    /// the pool is shutting down.
    pub(crate) async fn wait_for_start(&self) -> bool {
        match self.wakeup.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn close(&self) {
        self.wakeup.close();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("index", &self.index).finish()
    }
}
