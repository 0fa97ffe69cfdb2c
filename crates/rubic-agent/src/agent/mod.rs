//! The Rubic agent: runtimes, storages, workers, and the built-in methods.
//!
//! The agent owns a fixed pool of workers and two small registration
//! tables. It plugs into the RPC dispatcher with three methods:
//!
//! - `rubic.info` (sync): agent version, registered runtimes and storages.
//! - `rubic.queue` (async): dispatches work to the pool: `start` claims an
//!   idle worker, a `tid`-addressed request reaches a running runner at its
//!   next cooperation point.
//! - `rubic.status` (async): per-worker running flags.
//!
//! `fs.*` and `rubic.prog.*` handlers are external; they register against
//! the same [`MethodRegistry`] this module attaches to.

// Layer 1: Standard library imports
use std::path::PathBuf;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::task::JoinHandle;

// Layer 3: Internal module imports
use crate::bson::{get_bool, get_i32, get_props, get_str, measure, DocumentBuilder, Prop,
    MIN_DOCUMENT_LEN};
use crate::rpc::{AsyncMethod, Completion, ErrorCode, MethodRegistry, RegistryError, SyncMethod};

pub mod boot;
pub mod runner;
pub mod worker;

pub use runner::{ProgramSource, Runner, RunRequest, WorkerHandle};
pub use worker::{Worker, WorkerState};

use worker::StartContext;

/// Protocol compatibility version reported in `rubic.info`.
pub const RUBIC_VERSION: &str = "1.0.0";

/// One registered user-code runtime.
#[derive(Clone)]
pub struct RuntimeDescriptor {
    pub name: String,
    pub version: String,
    pub runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for RuntimeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// One registered storage root, addressed by logical name.
#[derive(Debug, Clone)]
pub struct StorageDescriptor {
    pub name: String,
    pub path: PathBuf,
}

pub(crate) struct AgentShared {
    pub(crate) runtimes: Vec<RuntimeDescriptor>,
    pub(crate) storages: Vec<StorageDescriptor>,
    pub(crate) workers: Vec<Arc<Worker>>,
    pub(crate) autoboot: bool,
}

/// Builder for a [`RubicAgent`]. Registrations are fixed once built.
pub struct RubicAgentBuilder {
    runtimes: Vec<RuntimeDescriptor>,
    storages: Vec<StorageDescriptor>,
    workers: usize,
    autoboot: bool,
}

impl RubicAgentBuilder {
    pub fn new() -> Self {
        Self {
            runtimes: Vec::new(),
            storages: Vec::new(),
            workers: 1,
            autoboot: false,
        }
    }

    /// Registers a runtime. The first registration becomes the default
    /// when a start request names none.
    pub fn register_runtime(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        self.runtimes.push(RuntimeDescriptor {
            name: name.into(),
            version: version.into(),
            runner,
        });
        self
    }

    /// Registers a storage root under a logical name.
    pub fn register_storage(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.storages.push(StorageDescriptor {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// Number of pool workers; at least one.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Enables the boot-record probe on worker 0.
    pub fn autoboot(mut self, enabled: bool) -> Self {
        self.autoboot = enabled;
        self
    }

    pub fn build(self) -> RubicAgent {
        let workers = (0..self.workers).map(|i| Worker::new(i as u8)).collect();
        RubicAgent {
            shared: Arc::new(AgentShared {
                runtimes: self.runtimes,
                storages: self.storages,
                workers,
                autoboot: self.autoboot,
            }),
        }
    }
}

impl Default for RubicAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled agent.
pub struct RubicAgent {
    shared: Arc<AgentShared>,
}

impl RubicAgent {
    pub fn builder() -> RubicAgentBuilder {
        RubicAgentBuilder::new()
    }

    /// Registers the built-in `rubic.*` methods on `registry`.
    pub fn attach(&self, registry: &MethodRegistry) -> Result<(), RegistryError> {
        registry.register_sync(
            "rubic.info",
            Arc::new(InfoMethod {
                shared: self.shared.clone(),
            }),
        )?;
        registry.register_async(
            "rubic.queue",
            Arc::new(QueueMethod {
                shared: self.shared.clone(),
            }),
        )?;
        registry.register_async(
            "rubic.status",
            Arc::new(StatusMethod {
                shared: self.shared.clone(),
            }),
        )?;
        Ok(())
    }

    /// Spawns every worker loop, returning their join handles.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.shared
            .workers
            .iter()
            .map(|worker| {
                tokio::spawn(worker_loop(self.shared.clone(), worker.clone()))
            })
            .collect()
    }

    /// Signals every worker loop to exit once idle.
    pub fn close(&self) {
        for worker in &self.shared.workers {
            worker.close();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Coordination handle for one worker, mainly for tests and embedders.
    pub fn worker_handle(&self, index: usize) -> Option<WorkerHandle> {
        self.shared
            .workers
            .get(index)
            .map(|worker| WorkerHandle::new(worker.clone()))
    }
}

impl std::fmt::Debug for RubicAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RubicAgent")
            .field("workers", &self.shared.workers.len())
            .field("runtimes", &self.shared.runtimes)
            .finish()
    }
}

/// One worker's service loop: idle, wait for a start, run, report, repeat.
async fn worker_loop(shared: Arc<AgentShared>, worker: Arc<Worker>) {
    if worker.index() == 0 && shared.autoboot {
        {
            let mut inner = worker.inner().lock().await;
            inner.state = WorkerState::AutoBoot;
        }
        let request = boot::load(&shared).await;
        {
            let mut inner = worker.inner().lock().await;
            inner.state = WorkerState::Idle;
        }
        if let Some(request) = request {
            // Synthetic start: no completion, so no reply is ever produced
            let mut inner = worker.inner().lock().await;
            inner.state = WorkerState::Starting;
            inner.start = Some(StartContext {
                request,
                completion: None,
            });
        }
    }

    loop {
        let has_start = {
            let mut inner = worker.inner().lock().await;
            if inner.start.is_none() {
                inner.state = WorkerState::Idle;
                false
            } else {
                true
            }
        };
        if !has_start && !worker.wait_for_start().await {
            break;
        }

        let request = {
            let inner = worker.inner().lock().await;
            match inner.start.as_ref() {
                Some(context) => context.request.clone(),
                None => continue,
            }
        };
        {
            let mut inner = worker.inner().lock().await;
            inner.state = WorkerState::Starting;
        }

        let outcome = match shared.runtimes.get(request.runtime).cloned() {
            Some(runtime) => {
                tracing::info!(
                    worker = worker.index(),
                    runtime = %runtime.name,
                    "invoking runner"
                );
                runtime
                    .runner
                    .run(&request, WorkerHandle::new(worker.clone()))
                    .await
            }
            None => Err(ErrorCode::NO_SUCH_PROCESS),
        };
        tracing::info!(worker = worker.index(), ok = outcome.is_ok(), "runner returned");

        let (start_completion, callback, stale) = {
            let mut inner = worker.inner().lock().await;
            let start_completion = inner.start.take().and_then(|context| context.completion);
            (start_completion, inner.callback.take(), inner.pending.take())
        };

        // Present only when the runner returned without ever reporting init
        if let Some(completion) = start_completion {
            match outcome {
                Ok(()) => completion.succeed(None).await,
                Err(code) => completion.fail(code).await,
            }
        }
        if let Some(callback) = callback {
            callback
                .succeed_i32(match outcome {
                    Ok(()) => 0,
                    Err(code) => code.value(),
                })
                .await;
        }
        if let Some(stale) = stale {
            stale.completion.fail(ErrorCode::NO_SUCH_PROCESS).await;
        }
    }
}

struct InfoMethod {
    shared: Arc<AgentShared>,
}

impl InfoMethod {
    fn info_document(&self) -> Result<Vec<u8>, ErrorCode> {
        let mut entries = Vec::with_capacity(self.shared.runtimes.len());
        for runtime in &self.shared.runtimes {
            let mut entry = DocumentBuilder::with_limit(
                MIN_DOCUMENT_LEN
                    + measure::str("name", &runtime.name)
                    + measure::str("version", &runtime.version),
            );
            entry.append_str("name", &runtime.name)?;
            entry.append_str("version", &runtime.version)?;
            entries.push(entry.into_bytes());
        }

        let keys: Vec<String> = (0..entries.len()).map(|i| i.to_string()).collect();
        let runtimes_limit = MIN_DOCUMENT_LEN
            + keys
                .iter()
                .zip(&entries)
                .map(|(key, entry)| measure::document(key, entry))
                .sum::<usize>();
        let mut runtimes = DocumentBuilder::with_limit(runtimes_limit);
        for (key, entry) in keys.iter().zip(&entries) {
            runtimes.append_document(key, entry)?;
        }
        let runtimes = runtimes.into_bytes();

        let storage_paths: Vec<(String, String)> = self
            .shared
            .storages
            .iter()
            .map(|storage| {
                (
                    storage.name.clone(),
                    storage.path.display().to_string(),
                )
            })
            .collect();
        let storages_limit = MIN_DOCUMENT_LEN
            + storage_paths
                .iter()
                .map(|(name, path)| measure::str(name, path))
                .sum::<usize>();
        let mut storages = DocumentBuilder::with_limit(storages_limit);
        for (name, path) in &storage_paths {
            storages.append_str(name, path)?;
        }
        let storages = storages.into_bytes();

        let mut info = DocumentBuilder::with_limit(
            MIN_DOCUMENT_LEN
                + measure::str("rubicVersion", RUBIC_VERSION)
                + measure::document("runtimes", &runtimes)
                + measure::document("storages", &storages),
        );
        info.append_str("rubicVersion", RUBIC_VERSION)?;
        info.append_array("runtimes", &runtimes)?;
        info.append_document("storages", &storages)?;
        Ok(info.into_bytes())
    }
}

impl SyncMethod for InfoMethod {
    fn call(&self, _params: &[u8]) -> Result<Option<Vec<u8>>, ErrorCode> {
        self.info_document().map(Some)
    }
}

struct QueueMethod {
    shared: Arc<AgentShared>,
}

impl QueueMethod {
    fn resolve_runtime(&self, name: &str) -> Result<usize, ErrorCode> {
        if name.is_empty() {
            if self.shared.runtimes.is_empty() {
                return Err(ErrorCode::NO_SUCH_PROCESS);
            }
            return Ok(0);
        }
        self.shared
            .runtimes
            .iter()
            .position(|runtime| runtime.name == name)
            .ok_or(ErrorCode::NO_SUCH_PROCESS)
    }
}

#[async_trait]
impl AsyncMethod for QueueMethod {
    async fn call(
        &self,
        params: &[u8],
        completion: &mut Option<Completion>,
    ) -> Result<(), ErrorCode> {
        let mut props = [
            Prop::new("name"),
            Prop::new("tid"),
            Prop::new("runtime"),
            Prop::new("file"),
            Prop::new("source"),
            Prop::new("debug"),
        ];
        get_props(params, &mut props);

        let name = get_str(params, props[0].offset, "");
        let tid = get_i32(params, props[1].offset, -1);

        if tid >= 0 {
            let worker = self
                .shared
                .workers
                .get(tid as usize)
                .ok_or(ErrorCode::NO_SUCH_PROCESS)?;
            if name.is_empty() {
                return Err(ErrorCode::INVALID_PARAMS);
            }
            return worker.post_request(name.to_owned(), completion).await;
        }

        if name == "start" {
            let runtime = self.resolve_runtime(get_str(params, props[2].offset, ""))?;
            let program = if props[3].offset.is_some() {
                ProgramSource::File(get_str(params, props[3].offset, "").to_owned())
            } else if props[4].offset.is_some() {
                ProgramSource::Inline(get_str(params, props[4].offset, "").to_owned())
            } else {
                return Err(ErrorCode::INVALID_PARAMS);
            };
            let request = RunRequest {
                runtime,
                program,
                debug: get_bool(params, props[5].offset, false),
            };

            for worker in &self.shared.workers {
                if worker.try_assign(request.clone(), completion).await {
                    return Ok(());
                }
            }
            return Err(ErrorCode::BUSY);
        }

        Err(ErrorCode::METHOD_NOT_FOUND)
    }
}

struct StatusMethod {
    shared: Arc<AgentShared>,
}

#[async_trait]
impl AsyncMethod for StatusMethod {
    async fn call(
        &self,
        _params: &[u8],
        completion: &mut Option<Completion>,
    ) -> Result<(), ErrorCode> {
        let mut running = Vec::with_capacity(self.shared.workers.len());
        for worker in &self.shared.workers {
            let state = worker.state().await;
            running.push(matches!(
                state,
                WorkerState::Starting | WorkerState::Running | WorkerState::Aborting
            ));
        }

        let mut entries = Vec::with_capacity(running.len());
        for flag in &running {
            let mut entry =
                DocumentBuilder::with_limit(MIN_DOCUMENT_LEN + measure::boolean("running"));
            entry.append_bool("running", *flag)?;
            entries.push(entry.into_bytes());
        }
        let keys: Vec<String> = (0..entries.len()).map(|i| i.to_string()).collect();
        let threads_limit = MIN_DOCUMENT_LEN
            + keys
                .iter()
                .zip(&entries)
                .map(|(key, entry)| measure::document(key, entry))
                .sum::<usize>();
        let mut threads = DocumentBuilder::with_limit(threads_limit);
        for (key, entry) in keys.iter().zip(&entries) {
            threads.append_document(key, entry)?;
        }
        let threads = threads.into_bytes();

        let mut status = DocumentBuilder::with_limit(
            MIN_DOCUMENT_LEN + measure::document("threads", &threads),
        );
        status.append_array("threads", &threads)?;

        let Some(completion) = completion.take() else {
            return Err(ErrorCode::INTERNAL_ERROR);
        };
        completion.succeed(Some(status.as_bytes())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::get_document;
    use crate::rpc::server::testing::noop_completion;

    struct ImmediateRunner;

    #[async_trait]
    impl Runner for ImmediateRunner {
        async fn run(
            &self,
            _request: &RunRequest,
            _worker: WorkerHandle,
        ) -> Result<(), ErrorCode> {
            Ok(())
        }
    }

    fn agent() -> RubicAgent {
        RubicAgent::builder()
            .register_runtime("mruby", "3.2.0", Arc::new(ImmediateRunner))
            .register_storage("internal", "/mnt/internal")
            .build()
    }

    fn offset(doc: &[u8], key: &str) -> Option<usize> {
        let mut props = [Prop::new(key)];
        get_props(doc, &mut props);
        props[0].offset
    }

    fn queue_params(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut params = DocumentBuilder::with_limit(256);
        for (key, value) in entries {
            params.append_str(key, value).unwrap();
        }
        params.into_bytes()
    }

    #[test]
    fn info_reports_version_runtimes_and_storages() {
        let agent = agent();
        let info = InfoMethod {
            shared: agent.shared.clone(),
        };
        let doc = info.info_document().unwrap();

        assert_eq!(get_str(&doc, offset(&doc, "rubicVersion"), ""), RUBIC_VERSION);

        let runtimes = get_document(&doc, offset(&doc, "runtimes")).unwrap();
        let first = get_document(runtimes, offset(runtimes, "0")).unwrap();
        assert_eq!(get_str(first, offset(first, "name"), ""), "mruby");
        assert_eq!(get_str(first, offset(first, "version"), ""), "3.2.0");

        let storages = get_document(&doc, offset(&doc, "storages")).unwrap();
        assert_eq!(
            get_str(storages, offset(storages, "internal"), ""),
            "/mnt/internal"
        );
    }

    #[tokio::test]
    async fn queue_start_claims_the_idle_worker() {
        let agent = agent();
        let queue = QueueMethod {
            shared: agent.shared.clone(),
        };
        let params = queue_params(&[("name", "start"), ("file", "main.rb")]);

        queue.call(&params, &mut None).await.unwrap();
        assert_eq!(agent.shared.workers[0].state().await, WorkerState::Starting);

        // The only worker is claimed: the next start is refused busy
        let err = queue.call(&params, &mut None).await.unwrap_err();
        assert_eq!(err, ErrorCode::BUSY);
    }

    #[tokio::test]
    async fn queue_rejects_bad_requests() {
        let agent = agent();
        let queue = QueueMethod {
            shared: agent.shared.clone(),
        };

        // Unknown operation name
        let err = queue
            .call(&queue_params(&[("name", "dance")]), &mut None)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::METHOD_NOT_FOUND);

        // Start without a program
        let err = queue
            .call(&queue_params(&[("name", "start")]), &mut None)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::INVALID_PARAMS);

        // Start naming an unregistered runtime
        let err = queue
            .call(
                &queue_params(&[("name", "start"), ("runtime", "lua"), ("file", "f")]),
                &mut None,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::NO_SUCH_PROCESS);
    }

    #[tokio::test]
    async fn queue_routes_tid_requests_to_that_worker() {
        let agent = agent();
        let queue = QueueMethod {
            shared: agent.shared.clone(),
        };

        // Out-of-range worker index
        let mut params = DocumentBuilder::with_limit(128);
        params.append_i32("tid", 9).unwrap();
        params.append_str("name", "abort").unwrap();
        let err = queue
            .call(&params.into_bytes(), &mut None)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::NO_SUCH_PROCESS);

        // In-range request lands in the worker's pending slot
        let mut params = DocumentBuilder::with_limit(128);
        params.append_i32("tid", 0).unwrap();
        params.append_str("name", "abort").unwrap();
        let params = params.into_bytes();
        queue
            .call(&params, &mut Some(noop_completion()))
            .await
            .unwrap();
        assert!(agent.shared.workers[0].inner().lock().await.pending.is_some());

        // Slot occupied: refused busy
        let err = queue
            .call(&params, &mut Some(noop_completion()))
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::BUSY);
    }
}
