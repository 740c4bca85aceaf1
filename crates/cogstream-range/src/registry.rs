//! Explicit registries owned by the embedding application.
//!
//! [`ClientRegistry`] retains HTTP clients keyed by the full connection
//! identity. [`BackendRegistry`] maps each [`BackendKind`] to the factory
//! that opens readers for it. Neither is global; callers create, share and
//! close them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::blocking::Client;
use tracing::debug;

use crate::http::build_client;
use crate::{
    open_range_reader, BackendKind, ConnectionDescriptor, ConnectionIdentity, RangeError,
    RangeReader, RangeReaderConfig, Result,
};

/// The parts of [`RangeReaderConfig`] baked into a built client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientSettings {
    timeout_ms: u64,
    connect_timeout_ms: u64,
    user_agent: String,
}

impl From<&RangeReaderConfig> for ClientSettings {
    fn from(config: &RangeReaderConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            connect_timeout_ms: config.connect_timeout_ms,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// HTTP clients retained per connection identity and client settings.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<(ConnectionIdentity, ClientSettings), Client>>,
    closed: AtomicBool,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `identity`, built from `config` on first use.
    ///
    /// Readers with the same identity but different timeouts or user agent
    /// get separate clients.
    pub fn client_for(
        &self,
        identity: &ConnectionIdentity,
        config: &RangeReaderConfig,
    ) -> Result<Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        let key = (identity.clone(), ClientSettings::from(config));
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        debug!(backend = %identity.backend, endpoint = %identity.endpoint, "creating backend client");
        let client = build_client(config)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Number of retained clients.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Whether no client is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every retained client and refuse new ones.
    ///
    /// Readers already opened keep their own handle to the pool.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.clients.lock().clear();
    }
}

/// Opens a reader for one backend kind.
pub trait BackendFactory: Send + Sync {
    /// Open a reader for `descriptor`.
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        config: &RangeReaderConfig,
        clients: &ClientRegistry,
    ) -> Result<Box<dyn RangeReader>>;
}

impl<F> BackendFactory for F
where
    F: Fn(&ConnectionDescriptor, &RangeReaderConfig, &ClientRegistry) -> Result<Box<dyn RangeReader>>
        + Send
        + Sync,
{
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        config: &RangeReaderConfig,
        clients: &ClientRegistry,
    ) -> Result<Box<dyn RangeReader>> {
        self(descriptor, config, clients)
    }
}

/// Backend selector: chooses the factory for a descriptor's kind.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<BackendKind, Arc<dyn BackendFactory>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().map(BackendKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("BackendRegistry").field("backends", &kinds).finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BackendRegistry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in file, HTTP, S3, Azure and GCS backends.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for kind in [
            BackendKind::File,
            BackendKind::Http,
            BackendKind::S3,
            BackendKind::Azure,
            BackendKind::Gcs,
        ] {
            registry.register(kind, open_range_reader);
        }
        registry
    }

    /// Register `factory` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: BackendKind, factory: impl BackendFactory + 'static) {
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Whether a factory is registered for `kind`.
    pub fn supports(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Open a reader for `descriptor` with the registered factory.
    pub fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        config: &RangeReaderConfig,
        clients: &ClientRegistry,
    ) -> Result<Box<dyn RangeReader>> {
        let kind = descriptor.kind();
        let factory = self.factories.get(&kind).ok_or_else(|| {
            RangeError::invalid_descriptor(format!("no backend registered for {kind}"))
        })?;
        factory.open(descriptor, config, clients)
    }
}
