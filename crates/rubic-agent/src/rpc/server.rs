//! The dispatcher: jobs in, framed replies out.
//!
//! `RpcServer` consumes jobs from the RPC channel mailbox, validates the
//! JSON-RPC envelope, and routes to the registered method. Synchronous
//! methods reply before the next job is taken; asynchronous methods carry a
//! [`Completion`] away and reply whenever they finish, so replies on the
//! wire are ordered by completion, not by arrival.
//!
//! Notifications (requests without an `id`) never produce a reply, error or
//! otherwise. When a reply exceeds the response budget it is rebuilt once
//! as a bare internal error; if even that does not fit, the reply is
//! dropped and the host's timeout takes over.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// Layer 3: Internal module imports
use super::channel::Job;
use super::envelope::{build_reply, parse_request, ErrorPayload, ParseOutcome, ReplyBody};
use super::error::ErrorCode;
use super::registry::{MethodKind, MethodRegistry};
use crate::bson::{get_document, EMPTY_DOCUMENT};
use crate::transport::{HostSource, SourceFlags};

/// Where and how replies leave the agent.
#[derive(Clone)]
pub(crate) struct ReplyPath {
    source: Arc<dyn HostSource>,
    channel: u8,
    max_response: usize,
}

impl ReplyPath {
    /// Builds and sends one reply. Notifications are silently satisfied; a
    /// reply over budget is retried once as a bare internal error and then
    /// dropped.
    async fn send(&self, request: &[u8], id_offset: Option<usize>, body: ReplyBody) {
        if id_offset.is_none() {
            return;
        }

        let reply = match build_reply(request, id_offset, &body, self.max_response) {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(%error, "reply over budget, retrying as internal error");
                let reduced = ReplyBody::Error(ErrorPayload::Code(ErrorCode::INTERNAL_ERROR));
                match build_reply(request, id_offset, &reduced, self.max_response) {
                    Ok(reply) => reply,
                    Err(error) => {
                        tracing::warn!(%error, "cannot build even the reduced reply, dropping");
                        return;
                    }
                }
            }
        };

        if let Err(error) = self
            .source
            .source(self.channel, &reply, SourceFlags::packetized())
            .await
        {
            tracing::warn!(%error, "failed to write reply to the host link");
        }
    }
}

impl std::fmt::Debug for ReplyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyPath")
            .field("channel", &self.channel)
            .field("max_response", &self.max_response)
            .finish()
    }
}

/// Deferred reply handle owned by an asynchronous method.
///
/// The completion owns the request document (for the byte-identical `id`
/// clone) and the reply path. Consuming it produces exactly one reply,
/// or none, when the request was a notification.
pub struct Completion {
    request: Vec<u8>,
    id_offset: Option<usize>,
    reply: ReplyPath,
}

impl Completion {
    /// Replies with a `result` subdocument, or a null result.
    pub async fn succeed(self, result: Option<&[u8]>) {
        self.reply
            .send(
                &self.request,
                self.id_offset,
                ReplyBody::Result(result.map(|doc| doc.to_vec())),
            )
            .await;
    }

    /// Replies with a bare int32 `result`.
    pub async fn succeed_i32(self, value: i32) {
        self.reply
            .send(&self.request, self.id_offset, ReplyBody::ResultInt(value))
            .await;
    }

    /// Replies with `error {code}`.
    pub async fn fail(self, code: ErrorCode) {
        self.reply
            .send(
                &self.request,
                self.id_offset,
                ReplyBody::Error(ErrorPayload::Code(code)),
            )
            .await;
    }

    /// Replies with a handler-built error document, extra fields preserved.
    pub async fn fail_with(self, error_doc: &[u8]) {
        self.reply
            .send(
                &self.request,
                self.id_offset,
                ReplyBody::Error(ErrorPayload::Doc(error_doc.to_vec())),
            )
            .await;
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("notification", &self.id_offset.is_none())
            .finish()
    }
}

/// JSON-RPC dispatcher over the job mailbox.
pub struct RpcServer {
    registry: Arc<MethodRegistry>,
    reply: ReplyPath,
    jobs: mpsc::Receiver<Job>,
}

impl RpcServer {
    /// Creates a dispatcher replying on `channel` through `source`, bounded
    /// by `max_response` bytes per reply.
    pub fn new(
        registry: Arc<MethodRegistry>,
        source: Arc<dyn HostSource>,
        channel: u8,
        max_response: usize,
        jobs: mpsc::Receiver<Job>,
    ) -> Self {
        Self {
            registry,
            reply: ReplyPath {
                source,
                channel,
                max_response,
            },
            jobs,
        }
    }

    /// Consumes and dispatches one job. Returns `false` once the mailbox
    /// side has shut down.
    pub async fn service(&mut self) -> bool {
        let Some(job) = self.jobs.recv().await else {
            return false;
        };
        self.dispatch(job).await;
        true
    }

    /// Runs the service loop until the mailbox closes.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while self.service().await {}
            tracing::debug!("rpc service loop exiting");
        })
    }

    async fn dispatch(&self, job: Job) {
        let request = job.into_document();

        let (method, params_offset, id_offset) = match parse_request(&request) {
            ParseOutcome::Call {
                method,
                params_offset,
                id_offset,
            } => (method, params_offset, id_offset),
            ParseOutcome::Invalid { error, id_offset } => {
                tracing::debug!(code = error.value(), "rejecting malformed request");
                self.reply
                    .send(
                        &request,
                        id_offset,
                        ReplyBody::Error(ErrorPayload::Code(error)),
                    )
                    .await;
                return;
            }
        };

        let Some(kind) = self.registry.lookup(&method) else {
            tracing::debug!(%method, "method not found");
            self.reply
                .send(
                    &request,
                    id_offset,
                    ReplyBody::Error(ErrorPayload::Code(ErrorCode::METHOD_NOT_FOUND)),
                )
                .await;
            return;
        };

        match kind {
            MethodKind::Sync(handler) => {
                let params = get_document(&request, params_offset).unwrap_or(&EMPTY_DOCUMENT);
                let body = match handler.call(params) {
                    Ok(result) => ReplyBody::Result(result),
                    Err(code) => ReplyBody::Error(ErrorPayload::Code(code)),
                };
                self.reply.send(&request, id_offset, body).await;
            }
            MethodKind::Async(handler) => {
                let params = get_document(&request, params_offset)
                    .unwrap_or(&EMPTY_DOCUMENT)
                    .to_vec();
                let mut completion = Some(Completion {
                    request,
                    id_offset,
                    reply: self.reply.clone(),
                });
                match handler.call(&params, &mut completion).await {
                    Ok(()) => {
                        if let Some(completion) = completion.take() {
                            tracing::warn!(%method, "async method left its completion behind");
                            completion.fail(ErrorCode::INTERNAL_ERROR).await;
                        }
                    }
                    Err(code) => match completion.take() {
                        Some(completion) => completion.fail(code).await,
                        None => {
                            tracing::warn!(%method, "async method failed after taking its completion");
                        }
                    },
                }
            }
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("registry", &self.registry)
            .field("reply", &self.reply)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::super::registry::AsyncMethod;
    use super::*;
    use crate::bson::{
        get_document, get_i32, get_props, get_str, DocumentBuilder, Prop,
    };
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Captures framed replies instead of writing to a link.
    struct CapturingSource {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl CapturingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn replies(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HostSource for CapturingSource {
        async fn source(
            &self,
            _channel: u8,
            bytes: &[u8],
            _flags: SourceFlags,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn request(method: &str, id: Option<i32>) -> Vec<u8> {
        let mut doc = DocumentBuilder::with_limit(256);
        doc.append_str("jsonrpc", "2.0").unwrap();
        doc.append_str("method", method).unwrap();
        if let Some(id) = id {
            doc.append_i32("id", id).unwrap();
        }
        doc.into_bytes()
    }

    fn reply_field(reply: &[u8], key: &str) -> Option<usize> {
        let mut props = [Prop::new(key)];
        get_props(reply, &mut props);
        props[0].offset
    }

    fn error_code_of(reply: &[u8]) -> i32 {
        let error = get_document(reply, reply_field(reply, "error")).unwrap();
        let mut props = [Prop::new("code")];
        get_props(error, &mut props);
        get_i32(error, props[0].offset, 0)
    }

    async fn dispatch_one(
        registry: Arc<MethodRegistry>,
        source: Arc<CapturingSource>,
        doc: Vec<u8>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let mut server = RpcServer::new(registry, source, 1, 4096, rx);
        tx.send(Job::from_document(doc)).await.unwrap();
        drop(tx);
        while server.service().await {}
    }

    #[tokio::test]
    async fn sync_method_result_reaches_the_wire() {
        let registry = Arc::new(MethodRegistry::new());
        registry
            .register_sync(
                "echo.version",
                Arc::new(|_params: &[u8]| -> Result<Option<Vec<u8>>, ErrorCode> {
                    let mut result = DocumentBuilder::with_limit(64);
                    result.append_str("version", "1.2.3")?;
                    Ok(Some(result.into_bytes()))
                }),
            )
            .unwrap();

        let source = CapturingSource::new();
        dispatch_one(registry, source.clone(), request("echo.version", Some(9))).await;

        let replies = source.replies();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(get_str(reply, reply_field(reply, "jsonrpc"), ""), "2.0");
        assert_eq!(get_i32(reply, reply_field(reply, "id"), 0), 9);
        let result = get_document(reply, reply_field(reply, "result")).unwrap();
        let mut props = [Prop::new("version")];
        get_props(result, &mut props);
        assert_eq!(get_str(result, props[0].offset, ""), "1.2.3");
    }

    #[tokio::test]
    async fn unknown_method_replies_not_found() {
        let registry = Arc::new(MethodRegistry::new());
        let source = CapturingSource::new();
        dispatch_one(registry, source.clone(), request("no.such", Some(7))).await;

        let replies = source.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(error_code_of(&replies[0]), -32601);
    }

    #[tokio::test]
    async fn notifications_are_never_answered() {
        let registry = Arc::new(MethodRegistry::new());
        registry
            .register_sync(
                "noisy",
                Arc::new(|_params: &[u8]| -> Result<Option<Vec<u8>>, ErrorCode> { Ok(None) }),
            )
            .unwrap();

        let source = CapturingSource::new();
        // Known method without id, then unknown method without id
        dispatch_one(registry.clone(), source.clone(), request("noisy", None)).await;
        dispatch_one(registry, source.clone(), request("no.such", None)).await;

        assert!(source.replies().is_empty());
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let mut doc = DocumentBuilder::with_limit(128);
        doc.append_str("jsonrpc", "3.0").unwrap();
        doc.append_str("method", "x").unwrap();
        doc.append_i32("id", 1).unwrap();

        let registry = Arc::new(MethodRegistry::new());
        let source = CapturingSource::new();
        dispatch_one(registry, source.clone(), doc.into_bytes()).await;

        assert_eq!(error_code_of(&source.replies()[0]), -32600);
    }

    #[tokio::test]
    async fn sync_error_code_becomes_error_reply() {
        let registry = Arc::new(MethodRegistry::new());
        registry
            .register_sync(
                "always.busy",
                Arc::new(|_params: &[u8]| -> Result<Option<Vec<u8>>, ErrorCode> {
                    Err(ErrorCode::BUSY)
                }),
            )
            .unwrap();

        let source = CapturingSource::new();
        dispatch_one(registry, source.clone(), request("always.busy", Some(2))).await;

        assert_eq!(error_code_of(&source.replies()[0]), -16);
    }

    #[tokio::test]
    async fn async_method_completes_later() {
        struct ParkAndAnswer;

        #[async_trait]
        impl AsyncMethod for ParkAndAnswer {
            async fn call(
                &self,
                _params: &[u8],
                completion: &mut Option<Completion>,
            ) -> Result<(), ErrorCode> {
                let completion = completion.take().ok_or(ErrorCode::INTERNAL_ERROR)?;
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    completion.succeed_i32(123).await;
                });
                Ok(())
            }
        }

        let registry = Arc::new(MethodRegistry::new());
        registry
            .register_async("deferred", Arc::new(ParkAndAnswer))
            .unwrap();

        let source = CapturingSource::new();
        dispatch_one(registry, source.clone(), request("deferred", Some(5))).await;

        // Wait out the spawned completion
        for _ in 0..32 {
            if !source.replies().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let replies = source.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(get_i32(&replies[0], reply_field(&replies[0], "result"), 0), 123);
        assert_eq!(get_i32(&replies[0], reply_field(&replies[0], "id"), 0), 5);
    }

    #[tokio::test]
    async fn async_error_without_taking_replies_immediately() {
        struct Refuses;

        #[async_trait]
        impl AsyncMethod for Refuses {
            async fn call(
                &self,
                _params: &[u8],
                _completion: &mut Option<Completion>,
            ) -> Result<(), ErrorCode> {
                Err(ErrorCode::NO_SUCH_PROCESS)
            }
        }

        let registry = Arc::new(MethodRegistry::new());
        registry.register_async("refused", Arc::new(Refuses)).unwrap();

        let source = CapturingSource::new();
        dispatch_one(registry, source.clone(), request("refused", Some(3))).await;

        assert_eq!(error_code_of(&source.replies()[0]), -3);
    }

    #[tokio::test]
    async fn oversized_reply_degrades_to_internal_error() {
        let registry = Arc::new(MethodRegistry::new());
        registry
            .register_sync(
                "huge",
                Arc::new(|_params: &[u8]| -> Result<Option<Vec<u8>>, ErrorCode> {
                    let mut result = DocumentBuilder::with_limit(512);
                    result.append_str("blob", &"x".repeat(400))?;
                    Ok(Some(result.into_bytes()))
                }),
            )
            .unwrap();

        let source = CapturingSource::new();
        let (tx, rx) = mpsc::channel(1);
        // Budget fits an error reply but not the 400-byte result
        let mut server = RpcServer::new(registry, source.clone(), 1, 128, rx);
        tx.send(Job::from_document(request("huge", Some(8))))
            .await
            .unwrap();
        drop(tx);
        while server.service().await {}

        let replies = source.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(error_code_of(&replies[0]), -32603);
        assert_eq!(get_i32(&replies[0], reply_field(&replies[0], "id"), 0), 8);
    }
}
