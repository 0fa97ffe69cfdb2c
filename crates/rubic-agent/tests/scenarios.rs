//! End-to-end scenarios over an in-memory host link: real frames in, real
//! frames out, with the full bridge / dispatcher / worker-pool stack in
//! between.

mod support;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::time::timeout;

use rubic_agent::bson::{get_document, get_i32, get_str, DocumentBuilder};
use rubic_agent::rpc::{register_rpc_channel, MethodRegistry, RpcServer};
use rubic_agent::transport::avm::AvmChannel;
use rubic_agent::transport::{Channel, ChannelRegistry, FrameDecoder, HostBridge, HostSource};
use rubic_agent::{
    ErrorCode, ProgramSource, RubicAgent, RunRequest, Runner, WorkerHandle,
};

use support::{field_offset, frame_packet, request, PacketCollector};

const RPC_CHANNEL: u8 = 1;
const WAIT: Duration = Duration::from_secs(5);

/// A cooperative runner: reports init, then spins on cooperation points
/// until aborted.
struct CoopRunner {
    saw_abort: Arc<AtomicBool>,
    launched: Arc<Mutex<Vec<String>>>,
}

impl CoopRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            saw_abort: Arc::new(AtomicBool::new(false)),
            launched: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Runner for CoopRunner {
    async fn run(&self, req: &RunRequest, worker: WorkerHandle) -> Result<(), ErrorCode> {
        let program = match &req.program {
            ProgramSource::File(file) => file.clone(),
            ProgramSource::Inline(_) => "<inline>".to_owned(),
        };
        self.launched.lock().unwrap().push(program);

        worker.notify_init().await?;
        loop {
            worker.cooperate().await;
            if worker.query_abort().await {
                self.saw_abort.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
    }
}

struct Harness {
    host_tx: WriteHalf<DuplexStream>,
    rpc_replies: Arc<PacketCollector>,
    avm_replies: Arc<PacketCollector>,
    agent: RubicAgent,
}

impl Harness {
    async fn send(&mut self, channel: u8, payload: &[u8]) {
        self.host_tx
            .write_all(&frame_packet(channel, payload))
            .await
            .unwrap();
        self.host_tx.flush().await.unwrap();
    }

    async fn call(&mut self, doc: &[u8]) -> Vec<u8> {
        self.send(RPC_CHANNEL, doc).await;
        timeout(WAIT, self.rpc_replies.next())
            .await
            .expect("reply within the deadline")
    }
}

async fn harness(runner: Arc<CoopRunner>, storages: Vec<(String, PathBuf)>, autoboot: bool) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (host, device) = tokio::io::duplex(1024);
    let (device_rx, device_tx) = tokio::io::split(device);
    let (mut host_rx, host_tx) = tokio::io::split(host);

    let bridge = HostBridge::new(device_tx);
    let source: Arc<dyn HostSource> = Arc::new(bridge.clone());

    AvmChannel::register(
        bridge.registry(),
        source.clone(),
        0x1000_0000,
        (0..16).collect(),
    )
    .unwrap();
    let jobs = register_rpc_channel(bridge.registry(), RPC_CHANNEL, 4096).unwrap();

    let mut builder = RubicAgent::builder()
        .register_runtime("r", "0.9.0", runner)
        .autoboot(autoboot);
    for (name, path) in storages {
        builder = builder.register_storage(name, path);
    }
    let agent = builder.build();

    let registry = Arc::new(MethodRegistry::new());
    agent.attach(&registry).unwrap();

    RpcServer::new(registry, source, RPC_CHANNEL, 4096, jobs).spawn();
    agent.start();
    bridge.start(device_rx);

    // Host-side reply decoding
    let host_registry = Arc::new(ChannelRegistry::new());
    let rpc_replies = PacketCollector::new();
    let avm_replies = PacketCollector::new();
    host_registry
        .register(Channel::packetized(RPC_CHANNEL, rpc_replies.clone()))
        .unwrap();
    host_registry
        .register(Channel::packetized(0, avm_replies.clone()))
        .unwrap();
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new(host_registry);
        let mut buffer = [0u8; 256];
        loop {
            match host_rx.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read_len) => decoder.feed(&buffer[..read_len]).await,
            }
        }
    });

    Harness {
        host_tx,
        rpc_replies,
        avm_replies,
        agent,
    }
}

fn error_code_of(reply: &[u8]) -> Option<i32> {
    let error = get_document(reply, field_offset(reply, "error"))?;
    Some(get_i32(error, field_offset(error, "code"), 0))
}

fn start_params(file: &str) -> Vec<u8> {
    let mut params = DocumentBuilder::with_limit(256);
    params.append_str("name", "start").unwrap();
    params.append_str("runtime", "r").unwrap();
    params.append_str("file", file).unwrap();
    params.into_bytes()
}

fn worker_op_params(tid: i32, name: &str) -> Vec<u8> {
    let mut params = DocumentBuilder::with_limit(128);
    params.append_i32("tid", tid).unwrap();
    params.append_str("name", name).unwrap();
    params.into_bytes()
}

// S1: an info call is answered on the RPC channel with version and id
#[tokio::test]
async fn info_call_round_trips() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    let reply = harness.call(&request("rubic.info", Some(42), None)).await;

    assert_eq!(get_str(&reply, field_offset(&reply, "jsonrpc"), ""), "2.0");
    assert_eq!(get_i32(&reply, field_offset(&reply, "id"), 0), 42);
    let result = get_document(&reply, field_offset(&reply, "result")).unwrap();
    assert_eq!(
        get_str(result, field_offset(result, "rubicVersion"), ""),
        rubic_agent::RUBIC_VERSION
    );
    let runtimes = get_document(result, field_offset(result, "runtimes")).unwrap();
    let first = get_document(runtimes, field_offset(runtimes, "0")).unwrap();
    assert_eq!(get_str(first, field_offset(first, "name"), ""), "r");
}

// S2: notifications never produce a reply, success or error
#[tokio::test]
async fn notifications_are_silent() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    harness
        .send(RPC_CHANNEL, &request("rubic.info", None, None))
        .await;
    harness
        .send(RPC_CHANNEL, &request("no.such", None, None))
        .await;

    // A later identified call must produce the very next reply
    let reply = harness.call(&request("rubic.info", Some(1), None)).await;
    assert_eq!(get_i32(&reply, field_offset(&reply, "id"), 0), 1);
    assert!(harness.rpc_replies.try_next().is_none());
}

// S3: unknown methods answer -32601
#[tokio::test]
async fn unknown_method_is_reported() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    let reply = harness.call(&request("no.such", Some(7), None)).await;
    assert_eq!(get_i32(&reply, field_offset(&reply, "id"), 0), 7);
    assert_eq!(error_code_of(&reply), Some(-32601));
}

// S4: reserved byte values inside a request survive the escape layer
#[tokio::test]
async fn reserved_bytes_survive_the_link() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    // 0x7a..0x7d as raw bytes inside a string value
    let tricky = String::from_utf8(vec![0x7a, 0x7b, 0x7c, 0x7d]).unwrap();
    let mut params = DocumentBuilder::with_limit(128);
    params.append_str("name", &tricky).unwrap();
    let doc = request("no.such", Some(9), Some(&params.into_bytes()));

    let reply = harness.call(&doc).await;
    // The request decoded cleanly end to end: the envelope parsed and the
    // dispatcher routed it far enough to reject the method name
    assert_eq!(get_i32(&reply, field_offset(&reply, "id"), 0), 9);
    assert_eq!(error_code_of(&reply), Some(-32601));
}

// S5: start, abort, and the runner's view of the abort flag
#[tokio::test]
async fn start_then_abort_cycle() {
    let runner = CoopRunner::new();
    let mut harness = harness(runner.clone(), Vec::new(), false).await;

    // Start claims worker 0 and answers {tid: 0} once the runner inits
    let reply = harness
        .call(&request("rubic.queue", Some(1), Some(&start_params("f"))))
        .await;
    let result = get_document(&reply, field_offset(&reply, "result")).unwrap();
    assert_eq!(get_i32(result, field_offset(result, "tid"), -1), 0);

    // The pool is saturated: a second start is refused busy
    let reply = harness
        .call(&request("rubic.queue", Some(2), Some(&start_params("g"))))
        .await;
    assert_eq!(error_code_of(&reply), Some(-16));

    // Status reflects the running worker
    let reply = harness
        .call(&request("rubic.status", Some(3), None))
        .await;
    let result = get_document(&reply, field_offset(&reply, "result")).unwrap();
    let threads = get_document(result, field_offset(result, "threads")).unwrap();
    let first = get_document(threads, field_offset(threads, "0")).unwrap();
    assert!(rubic_agent::bson::get_bool(
        first,
        field_offset(first, "running"),
        false
    ));

    // Abort reaches the runner at its next cooperation point
    let reply = harness
        .call(&request("rubic.queue", Some(4), Some(&worker_op_params(0, "abort"))))
        .await;
    assert!(field_offset(&reply, "result").is_some());
    assert!(field_offset(&reply, "error").is_none());

    timeout(WAIT, async {
        while !runner.saw_abort.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("runner observes the abort");

    // The worker becomes reusable once the aborted runner unwinds
    let mut restarted = None;
    for attempt in 0..50 {
        let reply = harness
            .call(&request("rubic.queue", Some(100 + attempt), Some(&start_params("again"))))
            .await;
        if let Some(result) = get_document(&reply, field_offset(&reply, "result")) {
            restarted = Some(get_i32(result, field_offset(result, "tid"), -1));
            break;
        }
        assert_eq!(error_code_of(&reply), Some(-16));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(restarted, Some(0));

    harness.agent.close();
}

// S6: out-of-window reads on channel 0 answer a single zero byte
#[tokio::test]
async fn avm_out_of_range_read() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    let mut header = vec![0x10, 0x00];
    header.extend_from_slice(&16u16.to_be_bytes());
    header.extend_from_slice(&0x2000_0000u32.to_be_bytes());
    harness.send(0, &header).await;

    let reply = timeout(WAIT, harness.avm_replies.next()).await.unwrap();
    assert_eq!(reply, vec![0x00]);
}

#[tokio::test]
async fn avm_in_window_read_returns_contents() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    let mut header = vec![0x14, 0x00];
    header.extend_from_slice(&4u16.to_be_bytes());
    header.extend_from_slice(&0x1000_0004u32.to_be_bytes());
    harness.send(0, &header).await;

    let reply = timeout(WAIT, harness.avm_replies.next()).await.unwrap();
    assert_eq!(reply, vec![4, 5, 6, 7]);
}

#[tokio::test]
async fn unknown_runtime_is_refused() {
    let mut harness = harness(CoopRunner::new(), Vec::new(), false).await;

    let mut params = DocumentBuilder::with_limit(128);
    params.append_str("name", "start").unwrap();
    params.append_str("runtime", "lua").unwrap();
    params.append_str("file", "f").unwrap();

    let reply = harness
        .call(&request("rubic.queue", Some(11), Some(&params.into_bytes())))
        .await;
    assert_eq!(error_code_of(&reply), Some(-3));
}

// AutoBoot: worker 0 launches the stored program without any RPC traffic
#[tokio::test]
async fn autoboot_launches_the_boot_record() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("boot.json"),
        br#"{"runtime": "r", "file": "auto.js"}"#,
    )
    .unwrap();

    let runner = CoopRunner::new();
    let harness = harness(
        runner.clone(),
        vec![("internal".to_owned(), root.path().to_path_buf())],
        true,
    )
    .await;

    timeout(WAIT, async {
        loop {
            if runner.launched.lock().unwrap().contains(&"auto.js".to_owned()) {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("autoboot launches the stored program");

    // Synthetic starts answer nobody
    assert!(harness.rpc_replies.try_next().is_none());
    harness.agent.close();
}
