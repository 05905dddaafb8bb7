// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine configuration, its storage port, and the process-level context.

use std::fs;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::error::DlError;
use crate::heap::Heap;
use crate::layout::Format;
use crate::registry::Registry;

/// Key under which [`EngineConfig`] is stored.
pub const ENGINE_CONFIG_KEY: &str = "engine";

/// Storage port for raw config blobs (keyed by logical name).
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw config blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Catch-all error variant.
    #[error("other: {0}")]
    Other(String),
}

/// Serializes config values as JSON and delegates storage to a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Load and deserialize the value for `key`; `Ok(None)` when missing or empty.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Serialize and persist the value for `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }

    /// Engine settings, or the defaults when none are stored.
    pub fn engine(&self) -> Result<EngineConfig, ConfigError> {
        Ok(self.load(ENGINE_CONFIG_KEY)?.unwrap_or_default())
    }
}

/// Engine settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Byte order and pointer width of live heaps.
    pub host: Format,
    /// Format that stored files are converted to.
    pub output: Format,
    /// Type-library files registered at startup, in order.
    pub libraries: Vec<PathBuf>,
}

/// Process-level engine state: the configuration and the registry built from it.
#[derive(Debug, Default)]
pub struct Context {
    config: EngineConfig,
    registry: Registry,
}

impl Context {
    /// Builds a registry by loading every configured library in order.
    #[instrument(skip_all, fields(libraries = config.libraries.len()))]
    pub fn from_config(config: &EngineConfig) -> Result<Self, DlError> {
        let mut registry = Registry::new();
        for path in &config.libraries {
            registry.load_library(&fs::read(path)?)?;
            info!(path = %path.display(), "type library loaded");
        }
        Ok(Self {
            config: config.clone(),
            registry,
        })
    }

    /// Settings this context was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry shared by every operation of this context.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry for registering libraries defined in code.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Empty heap in the configured host format.
    pub fn new_heap(&self) -> Heap {
        Heap::new(self.config.host)
    }
}
