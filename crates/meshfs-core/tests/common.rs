//! Common test fixtures: a fully wired coordinator over the in-memory
//! collaborators, plus a logging secondary for ordering assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use meshfs_core::cluster::{DiscoveryService, LocalCompute, LocalDiscovery, LocalMessaging};
use meshfs_core::data::MemoryDataManager;
use meshfs_core::error::Result;
use meshfs_core::events::RecordingEventBus;
use meshfs_core::meta::MemoryMetaManager;
use meshfs_core::secondary::{
    MemorySecondaryFs, SecondaryFileSystem, SecondaryReader, SecondaryStatus, SecondaryWriter,
};
use meshfs_core::{Collaborators, MeshFs, MeshFsConfig, MeshPath};

/// A coordinator plus handles to every collaborator it was wired to.
pub struct TestFs {
    pub fs: Arc<MeshFs>,
    pub meta: Arc<MemoryMetaManager>,
    pub data: Arc<MemoryDataManager>,
    pub secondary: Option<Arc<LoggingSecondaryFs>>,
    pub events: Arc<RecordingEventBus>,
    pub discovery: Arc<LocalDiscovery>,
    pub messaging: Arc<LocalMessaging>,
    pub compute: Arc<LocalCompute>,
}

pub fn p(s: &str) -> MeshPath {
    MeshPath::new(s).unwrap()
}

pub async fn start_fs(cfg: MeshFsConfig, with_secondary: bool) -> TestFs {
    start_fs_with_delay(cfg, with_secondary, Duration::ZERO).await
}

/// Starts a coordinator whose secondary writes take `write_delay` each, so
/// tests can observe batch/metadata ordering.
pub async fn start_fs_with_delay(
    cfg: MeshFsConfig,
    with_secondary: bool,
    write_delay: Duration,
) -> TestFs {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let events = Arc::new(RecordingEventBus::new());
    let meta = Arc::new(MemoryMetaManager::new());
    let discovery = Arc::new(LocalDiscovery::new(&cfg.name));
    let data = Arc::new(MemoryDataManager::new(1 << 16, 1 << 30, discovery.local_node()));
    let messaging = Arc::new(LocalMessaging::new());
    let compute = Arc::new(LocalCompute::new());

    let secondary =
        with_secondary.then(|| Arc::new(LoggingSecondaryFs::new(write_delay)));

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
            compute: compute.clone(),
            eviction: None,
        },
    )
    .await
    .unwrap();

    TestFs { fs, meta, data, secondary, events, discovery, messaging, compute }
}

/// Secondary filesystem that records an ordered operation log and can slow
/// down writer flushes.
pub struct LoggingSecondaryFs {
    inner: MemorySecondaryFs,
    log: Arc<Mutex<Vec<String>>>,
    write_delay: Duration,
}

impl LoggingSecondaryFs {
    pub fn new(write_delay: Duration) -> Self {
        LoggingSecondaryFs {
            inner: MemorySecondaryFs::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            write_delay,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn inner(&self) -> &MemorySecondaryFs {
        &self.inner
    }
}

struct LoggingWriter {
    inner: Box<dyn SecondaryWriter>,
    path: MeshPath,
    log: Arc<Mutex<Vec<String>>>,
    write_delay: Duration,
}

#[async_trait]
impl SecondaryWriter for LoggingWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.inner.write(data).await?;
        self.log.lock().unwrap().push(format!("write:{}", self.path));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await?;
        self.log.lock().unwrap().push(format!("close:{}", self.path));
        Ok(())
    }
}

#[async_trait]
impl SecondaryFileSystem for LoggingSecondaryFs {
    async fn exists(&self, path: &MeshPath) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn info(&self, path: &MeshPath) -> Result<Option<SecondaryStatus>> {
        self.inner.info(path).await
    }

    async fn list_paths(&self, path: &MeshPath) -> Result<Vec<MeshPath>> {
        self.inner.list_paths(path).await
    }

    async fn list_files(&self, path: &MeshPath) -> Result<Vec<SecondaryStatus>> {
        self.inner.list_files(path).await
    }

    async fn mkdirs(&self, path: &MeshPath, props: &HashMap<String, String>) -> Result<()> {
        self.inner.mkdirs(path, props).await
    }

    async fn create(
        &self,
        path: &MeshPath,
        overwrite: bool,
        props: Option<&HashMap<String, String>>,
    ) -> Result<Box<dyn SecondaryWriter>> {
        let inner = self.inner.create(path, overwrite, props).await?;
        Ok(Box::new(LoggingWriter {
            inner,
            path: path.clone(),
            log: self.log.clone(),
            write_delay: self.write_delay,
        }))
    }

    async fn append(&self, path: &MeshPath, create: bool) -> Result<Box<dyn SecondaryWriter>> {
        let inner = self.inner.append(path, create).await?;
        Ok(Box::new(LoggingWriter {
            inner,
            path: path.clone(),
            log: self.log.clone(),
            write_delay: self.write_delay,
        }))
    }

    async fn open(&self, path: &MeshPath) -> Result<Box<dyn SecondaryReader>> {
        self.inner.open(path).await
    }

    async fn rename(&self, src: &MeshPath, dest: &MeshPath) -> Result<()> {
        self.inner.rename(src, dest).await
    }

    async fn delete(&self, path: &MeshPath, recursive: bool) -> Result<bool> {
        let res = self.inner.delete(path, recursive).await?;
        self.log.lock().unwrap().push(format!("delete:{path}"));
        Ok(res)
    }

    async fn update(
        &self,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<Option<SecondaryStatus>> {
        self.inner.update(path, props).await
    }

    async fn used_space_size(&self) -> Result<u64> {
        self.inner.used_space_size().await
    }

    async fn properties(&self) -> HashMap<String, String> {
        self.inner.properties().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
