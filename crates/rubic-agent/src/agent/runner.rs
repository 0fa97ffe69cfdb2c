//! The runner contract: how user-code runtimes cooperate with the agent.
//!
//! A runner executes one program on behalf of a worker. The agent has no
//! preemption; the entire coordination surface is the [`WorkerHandle`]
//! passed into [`Runner::run`]:
//!
//! - [`notify_init`](WorkerHandle::notify_init) exactly once after the
//!   runtime has initialized; this is what answers the `queue` request
//!   that launched the program.
//! - [`cooperate`](WorkerHandle::cooperate) periodically from the
//!   execution loop; this is where queued abort/callback requests are
//!   honored.
//! - [`query_abort`](WorkerHandle::query_abort) after cooperating; once it
//!   reports true the runner is expected to wind down and return.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
use super::worker::{Worker, WorkerState};
use crate::bson::{measure, DocumentBuilder, MIN_DOCUMENT_LEN};
use crate::rpc::ErrorCode;

/// What a queued program executes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    /// Path of a stored program file.
    File(String),
    /// Program text supplied inline with the request.
    Inline(String),
}

/// One start request as handed to a runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Index into the agent's runtime table.
    pub(crate) runtime: usize,
    pub program: ProgramSource,
    pub debug: bool,
}

/// A registered user-code runtime.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Executes one program to completion (or until aborted).
    async fn run(&self, request: &RunRequest, worker: WorkerHandle) -> Result<(), ErrorCode>;
}

/// A runner's view of the worker that invoked it.
#[derive(Clone)]
pub struct WorkerHandle {
    worker: Arc<Worker>,
}

impl WorkerHandle {
    pub(crate) fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// Index of the worker executing this runner.
    pub fn index(&self) -> u8 {
        self.worker.index()
    }

    /// Reports successful runtime initialization.
    ///
    /// Answers the start request with `{tid}` and moves the worker to
    /// `Running`. Must be called exactly once; calling it from any state
    /// but `Starting` fails. If the reply cannot be built the start request
    /// is answered with an out-of-memory error and the worker is parked in
    /// `Failed` until the runner returns.
    pub async fn notify_init(&self) -> Result<(), ErrorCode> {
        let mut inner = self.worker.inner().lock().await;
        if inner.state != WorkerState::Starting {
            return Err(ErrorCode::INVALID);
        }
        let completion = inner.start.as_mut().and_then(|ctx| ctx.completion.take());

        let Some(completion) = completion else {
            // Synthetic start (AutoBoot): nothing to answer
            inner.state = WorkerState::Running;
            return Ok(());
        };

        let mut reply = DocumentBuilder::with_limit(MIN_DOCUMENT_LEN + measure::i32("tid"));
        match reply.append_i32("tid", i32::from(self.worker.index())) {
            Ok(()) => {
                inner.state = WorkerState::Running;
                drop(inner);
                completion.succeed(Some(reply.as_bytes())).await;
                Ok(())
            }
            Err(error) => {
                tracing::error!(%error, "cannot build the init reply");
                inner.state = WorkerState::Failed;
                drop(inner);
                completion.fail(ErrorCode::NO_MEMORY).await;
                Err(ErrorCode::NO_MEMORY)
            }
        }
    }

    /// Cooperation point: honors at most one queued request.
    ///
    /// `abort` moves the worker to `Aborting` and answers null; `callback`
    /// parks the request for completion when the runner returns; anything
    /// else is answered with a method-not-found error. Also yields to the
    /// scheduler, so a tight runner loop stays preemptible.
    pub async fn cooperate(&self) {
        tokio::task::yield_now().await;

        let request = {
            let mut inner = self.worker.inner().lock().await;
            inner.pending.take()
        };
        let Some(request) = request else {
            return;
        };

        match request.name.as_str() {
            "abort" => {
                {
                    let mut inner = self.worker.inner().lock().await;
                    inner.state = WorkerState::Aborting;
                }
                tracing::debug!(worker = self.worker.index(), "abort requested");
                request.completion.succeed(None).await;
            }
            "callback" => {
                let mut inner = self.worker.inner().lock().await;
                if inner.callback.is_some() {
                    drop(inner);
                    request.completion.fail(ErrorCode::BUSY).await;
                } else {
                    inner.callback = Some(request.completion);
                }
            }
            other => {
                tracing::debug!(worker = self.worker.index(), name = other, "unknown worker request");
                request.completion.fail(ErrorCode::METHOD_NOT_FOUND).await;
            }
        }
    }

    /// True once an abort has been requested for this worker.
    pub async fn query_abort(&self) -> bool {
        self.worker.inner().lock().await.state == WorkerState::Aborting
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.worker.index())
            .finish()
    }
}
