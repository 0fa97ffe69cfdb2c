//! BSON-encoded JSON-RPC 2.0 server.
//!
//! The pieces line up with the inbound data path: [`channel`] reassembles
//! one request document per packet and parks it in a single-slot mailbox,
//! [`server`] consumes the mailbox and dispatches through the method table
//! in [`registry`], and [`envelope`] owns the wire shape of requests and
//! replies.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod server;

pub use channel::{register as register_rpc_channel, Job};
pub use envelope::JSONRPC_VERSION;
pub use error::{ErrorCode, RegistryError};
pub use registry::{AsyncMethod, MethodRegistry, SyncMethod};
pub use server::{Completion, RpcServer};
