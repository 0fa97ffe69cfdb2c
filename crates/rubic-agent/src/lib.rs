//! Rubic host-bridge agent core.
//!
//! An embedded agent that lets a host program, query, and monitor user code
//! running inside a device, over a single serial byte link. The crate is
//! organized along the inbound data path:
//!
//! - **Transport** (`transport`): a packetized stream demultiplexer. A
//!   byte-at-a-time framing codec routes link bytes to named channels:
//!   the memory-inspection channel, the RPC channel, dynamically
//!   registered pipes.
//! - **BSON** (`bson`): the on-wire encoding of RPC traffic. Strict
//!   bounds-checked reads, measure-before-alloc writes.
//! - **RPC** (`rpc`): a JSON-RPC 2.0 server over BSON documents, with a
//!   unified sync/async method registry and deferred completions.
//! - **Agent** (`agent`): the worker pool and runner coordination:
//!   `rubic.queue` launches user code, cooperative abort stops it, and
//!   AutoBoot launches a stored program with no host attached.
//!
//! # Wiring it together
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rubic_agent::{
//!     agent::RubicAgent,
//!     rpc::{register_rpc_channel, MethodRegistry, RpcServer},
//!     settings::Settings,
//!     transport::{avm::AvmChannel, HostBridge, HostSource},
//! };
//!
//! # async fn wire(
//! #     reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
//! #     writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let bridge = HostBridge::new(writer);
//! let source: Arc<dyn HostSource> = Arc::new(bridge.clone());
//!
//! AvmChannel::register(
//!     bridge.registry(),
//!     source.clone(),
//!     settings.avm.window_base,
//!     vec![0; settings.avm.window_span],
//! )?;
//! let jobs = register_rpc_channel(
//!     bridge.registry(),
//!     settings.transport.rpc_channel,
//!     settings.rpc.max_request,
//! )?;
//!
//! let registry = Arc::new(MethodRegistry::new());
//! let agent = RubicAgent::builder()
//!     .workers(settings.workers.count)
//!     .build();
//! agent.attach(&registry)?;
//!
//! let server = RpcServer::new(
//!     registry,
//!     source,
//!     settings.transport.rpc_channel,
//!     settings.rpc.max_response,
//!     jobs,
//! );
//! agent.start();
//! server.spawn();
//! bridge.start(reader);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod bson;
pub mod rpc;
pub mod settings;
pub mod transport;

pub use agent::{
    ProgramSource, RubicAgent, RubicAgentBuilder, RunRequest, Runner, WorkerHandle, WorkerState,
    RUBIC_VERSION,
};
pub use rpc::{
    AsyncMethod, Completion, ErrorCode, MethodRegistry, RegistryError, RpcServer, SyncMethod,
};
pub use settings::Settings;
pub use transport::{
    Channel, ChannelRegistry, ChannelSink, HostBridge, HostSource, PacketFlags, SourceFlags,
    TransportError,
};
