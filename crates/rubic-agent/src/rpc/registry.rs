//! Method registry: name to handler mapping.
//!
//! Sync and async methods share one table. Registration appends and rejects
//! duplicate names; lookup is a linear scan over the handful of methods an
//! agent exposes.

// Layer 1: Standard library imports
use std::sync::{Arc, PoisonError, RwLock};

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
use super::error::{ErrorCode, RegistryError};
use super::server::Completion;

/// A method answered inline by the dispatcher.
///
/// Returning `Ok(Some(doc))` makes `doc` the `result` subdocument;
/// `Ok(None)` replies with a null result; `Err(code)` replies with
/// `error {code}`.
pub trait SyncMethod: Send + Sync {
    fn call(&self, params: &[u8]) -> Result<Option<Vec<u8>>, ErrorCode>;
}

impl<F> SyncMethod for F
where
    F: Fn(&[u8]) -> Result<Option<Vec<u8>>, ErrorCode> + Send + Sync,
{
    fn call(&self, params: &[u8]) -> Result<Option<Vec<u8>>, ErrorCode> {
        self(params)
    }
}

/// A method that completes out of band.
///
/// An implementation that accepts the request takes the [`Completion`] out
/// of `completion` and returns `Ok(())`; the reply is produced whenever the
/// completion is consumed. Returning `Err(code)` while leaving the
/// completion in place makes the dispatcher reply immediately with that
/// error.
#[async_trait]
pub trait AsyncMethod: Send + Sync {
    async fn call(
        &self,
        params: &[u8],
        completion: &mut Option<Completion>,
    ) -> Result<(), ErrorCode>;
}

/// Handler attached to a registered name.
#[derive(Clone)]
pub(crate) enum MethodKind {
    Sync(Arc<dyn SyncMethod>),
    Async(Arc<dyn AsyncMethod>),
}

struct MethodEntry {
    name: String,
    kind: MethodKind,
}

/// Append-only method table shared by the dispatcher and registrars.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use rubic_agent::rpc::{ErrorCode, MethodRegistry};
///
/// let registry = MethodRegistry::new();
/// registry
///     .register_sync(
///         "fs.ping",
///         Arc::new(|_params: &[u8]| -> Result<Option<Vec<u8>>, ErrorCode> { Ok(None) }),
///     )
///     .unwrap();
/// assert_eq!(registry.method_names(), vec!["fs.ping".to_string()]);
/// ```
#[derive(Default)]
pub struct MethodRegistry {
    entries: RwLock<Vec<MethodEntry>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous method.
    pub fn register_sync(
        &self,
        name: &str,
        method: Arc<dyn SyncMethod>,
    ) -> Result<(), RegistryError> {
        self.register(name, MethodKind::Sync(method))
    }

    /// Registers an asynchronous method.
    pub fn register_async(
        &self,
        name: &str,
        method: Arc<dyn AsyncMethod>,
    ) -> Result<(), RegistryError> {
        self.register(name, MethodKind::Async(method))
    }

    fn register(&self, name: &str, kind: MethodKind) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|entry| entry.name == name) {
            return Err(RegistryError::Duplicate {
                name: name.to_owned(),
            });
        }
        entries.push(MethodEntry {
            name: name.to_owned(),
            kind,
        });
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<MethodKind> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.kind.clone())
    }

    /// Registered method names, in registration order.
    pub fn method_names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}
