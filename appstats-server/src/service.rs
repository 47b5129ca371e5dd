use std::sync::Arc;

use appstats_config::Config;
use appstats_rollup::{IngestMessage, RollupWriter, StoreClient};
use appstats_system::{Addr, ServiceRunner};

#[derive(Debug)]
struct StateInner {
    config: Arc<Config>,
    store: Arc<StoreClient>,
    ingest: Addr<IngestMessage>,
}

/// Server state shared by the listeners and all endpoints.
///
/// Cloning the state is cheap.
#[derive(Clone, Debug)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl ServiceState {
    /// Starts the rollup writer and returns the state pointing to it.
    ///
    /// The store is not connected yet. The writer and the endpoints connect lazily on first use.
    pub fn start(config: Arc<Config>, runner: &mut ServiceRunner) -> Self {
        let store = Arc::new(StoreClient::new(config.storage()));
        appstats_log::info!(backend = %store.backend(), "configured rollup store");

        let writer = RollupWriter::new(store.clone(), config.error_statistics());
        let ingest = runner.start(writer, config.queue_size());

        Self::new(config, store, ingest)
    }

    /// Creates a state from already running parts.
    pub fn new(config: Arc<Config>, store: Arc<StoreClient>, ingest: Addr<IngestMessage>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                config,
                store,
                ingest,
            }),
        }
    }

    /// Returns the current config.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the store client shared with the writer.
    pub fn store(&self) -> &StoreClient {
        &self.inner.store
    }

    /// Returns the address of the ingestion queue.
    pub fn ingest(&self) -> &Addr<IngestMessage> {
        &self.inner.ingest
    }
}
