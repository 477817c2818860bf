//! In-process test bed: one coordinator over in-memory collaborators.

use std::sync::Arc;

use meshfs_core::cluster::{DiscoveryService, LocalCompute, LocalDiscovery, LocalMessaging};
use meshfs_core::data::MemoryDataManager;
use meshfs_core::events::RecordingEventBus;
use meshfs_core::meta::MemoryMetaManager;
use meshfs_core::secondary::{MemorySecondaryFs, SecondaryFileSystem};
use meshfs_core::{Collaborators, MeshFs, MeshFsConfig, MeshPath, Result};

/// One coordinator and handles to the collaborators behind it.
pub struct TestBed {
    /// The coordinator under test.
    pub fs: Arc<MeshFs>,
    /// The namespace tree behind it.
    pub meta: Arc<MemoryMetaManager>,
    /// The block store behind it.
    pub data: Arc<MemoryDataManager>,
    /// The secondary filesystem, when configured.
    pub secondary: Option<Arc<MemorySecondaryFs>>,
    /// Recorded events.
    pub events: Arc<RecordingEventBus>,
    /// Cluster membership view.
    pub discovery: Arc<LocalDiscovery>,
    /// Peer messaging fabric.
    pub messaging: Arc<LocalMessaging>,
}

impl TestBed {
    /// Starts a coordinator with default configuration.
    pub async fn start(with_secondary: bool) -> Self {
        Self::start_with(MeshFsConfig::default(), with_secondary).await
    }

    /// Starts a coordinator with the supplied configuration.
    pub async fn start_with(cfg: MeshFsConfig, with_secondary: bool) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let events = Arc::new(RecordingEventBus::new());
        let meta = Arc::new(MemoryMetaManager::new());
        let discovery = Arc::new(LocalDiscovery::new(&cfg.name));
        let data = Arc::new(MemoryDataManager::new(
            1 << 16,
            1 << 30,
            discovery.local_node(),
        ));
        let messaging = Arc::new(LocalMessaging::new());
        let secondary = with_secondary.then(|| Arc::new(MemorySecondaryFs::new()));

        let fs = MeshFs::start(
            cfg,
            Collaborators {
                meta: meta.clone(),
                data: data.clone(),
                secondary: secondary
                    .clone()
                    .map(|s| s as Arc<dyn SecondaryFileSystem>),
                events: events.clone(),
                discovery: discovery.clone(),
                messaging: messaging.clone(),
                compute: Arc::new(LocalCompute::new()),
                eviction: None,
            },
        )
        .await
        .expect("coordinator must start");

        tracing::debug!(name = %fs.name(), "test bed started");

        TestBed { fs, meta, data, secondary, events, discovery, messaging }
    }

    /// Creates a file with the given content through the public API.
    pub async fn write_file(&self, path: &MeshPath, content: &[u8]) -> Result<()> {
        let mut w = self.fs.create(path, true).await?;
        w.write(content).await?;
        w.close().await
    }

    /// Reads a whole file through the public API.
    pub async fn read_file(&self, path: &MeshPath) -> Result<Vec<u8>> {
        let mut r = self.fs.open(path).await?;
        let content = r.read_to_end().await?;
        r.close().await?;
        Ok(content)
    }
}
