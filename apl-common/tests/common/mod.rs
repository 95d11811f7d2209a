#![allow(dead_code)]

use std::sync::Arc;

use apl_common::Appliance;
use apl_common::config::HarnessConfig;
use apl_common::mock::{MemoryStore, MemoryStoreOpener, MockChannel, MockConnector, ScriptedProbe};
use tracing_subscriber::{EnvFilter, fmt};

pub const ADDRESS: &str = "10.0.0.5";

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env().add_directive("apl_common=debug".parse().unwrap()))
        .try_init();
}

/// An appliance wired to in-memory collaborators, plus handles on them.
pub struct TestAppliance {
    pub appliance: Arc<Appliance>,
    pub connector: Arc<MockConnector>,
    pub probe: Arc<ScriptedProbe>,
    pub store: MemoryStore,
    pub opener: Arc<MemoryStoreOpener>,
}

impl TestAppliance {
    /// Internal database on the appliance itself.
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    pub fn with_config(config: HarnessConfig) -> Self {
        init_test_logging();
        let connector = Arc::new(MockConnector::new());
        let probe = Arc::new(ScriptedProbe::new());
        let store = MemoryStore::new(ADDRESS);
        let opener = Arc::new(MemoryStoreOpener::new(store.clone()));
        let appliance = Appliance::from_url(ADDRESS)
            .unwrap()
            .config(Arc::new(config))
            .db_host(ADDRESS)
            .connector(connector.clone())
            .reachability(probe.clone())
            .store_opener(opener.clone())
            .build()
            .unwrap();
        Self {
            appliance: Arc::new(appliance),
            connector,
            probe,
            store,
            opener,
        }
    }

    /// Channel to the appliance.
    pub fn channel(&self) -> Arc<MockChannel> {
        self.connector.channel(ADDRESS)
    }
}
