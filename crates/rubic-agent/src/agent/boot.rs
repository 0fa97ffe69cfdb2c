//! AutoBoot: launching a stored program without a host attached.
//!
//! At service start, worker 0 looks for `boot.json` under the `internal`
//! storage root. The record names the runtime and the program file; a
//! successful parse synthesizes a start request with no RPC context, so no
//! reply is ever produced for it. Any failure simply leaves the worker
//! idle.

// Layer 1: Standard library imports
// (None)

// Layer 2: Third-party crate imports
use serde::Deserialize;

// Layer 3: Internal module imports
use super::runner::{ProgramSource, RunRequest};
use super::AgentShared;

/// Storage name the boot record is read from.
pub(crate) const BOOT_STORAGE: &str = "internal";

/// File name of the boot record.
pub(crate) const BOOT_FILE: &str = "boot.json";

#[derive(Debug, Deserialize)]
struct BootRecord {
    /// Runtime name; the default runtime when omitted.
    runtime: Option<String>,
    file: String,
}

/// Reads and resolves the boot record, if one exists.
pub(crate) async fn load(shared: &AgentShared) -> Option<RunRequest> {
    let storage = shared
        .storages
        .iter()
        .find(|storage| storage.name == BOOT_STORAGE)?;
    let path = storage.path.join(BOOT_FILE);

    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(error) => {
            tracing::debug!(%error, path = %path.display(), "no boot record");
            return None;
        }
    };
    let record: BootRecord = match serde_json::from_slice(&raw) {
        Ok(record) => record,
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "boot record is not valid JSON");
            return None;
        }
    };

    let runtime = match record.runtime.as_deref() {
        Some(name) => shared
            .runtimes
            .iter()
            .position(|runtime| runtime.name == name),
        None => (!shared.runtimes.is_empty()).then_some(0),
    };
    let Some(runtime) = runtime else {
        tracing::warn!(runtime = ?record.runtime, "boot record names an unknown runtime");
        return None;
    };

    tracing::info!(file = %record.file, "auto-booting stored program");
    Some(RunRequest {
        runtime,
        program: ProgramSource::File(record.file),
        debug: false,
    })
}
