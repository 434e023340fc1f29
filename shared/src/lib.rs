#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capabilities;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod registry;
pub mod state;
pub mod store;

use std::sync::Arc;

use tracing::info;

pub use capabilities::{AdapterCapability, DisplayHandleHost, SlotStore};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, ValidationError};
pub use event::Event;
pub use registry::{ProviderRegistry, FALLBACK_SOURCE_ID};
pub use state::{Snapshot, StateContainer};
pub use store::{DurableStore, StorageHost, StoreError};

/// The three core services wired from one configuration.
pub struct Core {
    pub store: Arc<DurableStore>,
    pub state: StateContainer,
    pub registry: ProviderRegistry,
}

impl Core {
    /// Validates `config` and wires the services over the given host. Nothing
    /// is read from the store until [`StateContainer::load_from_store`].
    pub fn new(
        config: &CoreConfig,
        host: Arc<dyn StorageHost>,
        display: Arc<dyn DisplayHandleHost>,
        slots: Arc<dyn SlotStore>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let store = Arc::new(DurableStore::new(host));
        let state = StateContainer::new(Arc::clone(&store), display);
        let registry = ProviderRegistry::load(slots, config)?;
        info!(sources = registry.sources().len(), "core wired");
        Ok(Self {
            store,
            state,
            registry,
        })
    }

    /// Uses the SQLite database named by the store configuration.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn with_sqlite(
        config: &CoreConfig,
        display: Arc<dyn DisplayHandleHost>,
        slots: Arc<dyn SlotStore>,
    ) -> CoreResult<Self> {
        let host = Arc::new(store::SqliteHost::from_config(&config.store));
        Self::new(config, host, display, slots)
    }
}
