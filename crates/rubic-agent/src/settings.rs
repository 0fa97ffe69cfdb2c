//! Agent configuration.
//!
//! Settings cover the knobs a deployment actually varies: channel numbers,
//! buffer budgets, pool size and the introspection window. Everything has a
//! default matching the reference firmware, so `Settings::default()` is a
//! working configuration and a TOML file only needs to override what it
//! changes.

// Layer 1: Standard library imports
// (None)

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Layer 3: Internal module imports
// (None)

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportSettings,
    pub rpc: RpcSettings,
    pub workers: WorkerSettings,
    pub avm: AvmSettings,
}

/// Host-link transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Channel number the RPC server listens on.
    pub rpc_channel: u8,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self { rpc_channel: 1 }
    }
}

/// RPC buffer budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Largest accepted request document, in bytes.
    pub max_request: usize,
    /// Largest reply document the dispatcher will build, in bytes.
    pub max_response: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_request: 4096,
            max_response: 4096,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Pool size; values below one are treated as one.
    pub count: usize,
    /// Probe `boot.json` on worker 0 at service start.
    pub autoboot: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            autoboot: false,
        }
    }
}

/// Memory-inspection window published on channel 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvmSettings {
    /// Address the window appears at.
    pub window_base: u32,
    /// Window length in bytes.
    pub window_span: usize,
}

impl Default for AvmSettings {
    fn default() -> Self {
        Self {
            window_base: 0x1000_0000,
            window_span: 16,
        }
    }
}

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The input was not valid TOML (or violated the schema).
    #[error("configuration is not valid TOML: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

impl Settings {
    /// Parses settings from TOML text, filling omitted fields with
    /// defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(raw)?)
    }
}
