//! Shared fixtures for the engine tests.

use crate::config::DownloadConfig;
use crate::core::engine::Engine;
use crate::core::events::EngineEvent;
use crate::core::model::DownloadRecord;
use crate::core::store::SqliteStore;
use crate::core::task::{DownloadRequest, DownloadTask, LifecycleObserver, TaskContext};
use crate::driver::mock::MockDriver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Observer for tasks run outside an engine.
pub struct Noop;

impl LifecycleObserver for Noop {
    fn on_download_start(&self, _task: &Arc<DownloadTask>) {}
    fn on_download_end(&self, _task: &Arc<DownloadTask>) {}
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub ctx: TaskContext,
    pub driver: Arc<MockDriver>,
    pub events: broadcast::Sender<EngineEvent>,
}

impl Fixture {
    pub async fn new(driver: MockDriver) -> Self {
        Self::with_config(driver, |_| {}).await
    }

    pub async fn with_config(driver: MockDriver, tweak: impl FnOnce(&mut DownloadConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = DownloadConfig {
            data_dir: dir.path().join("data"),
            retry_delay_ms: 1,
            min_usable_space: 0,
            ..Default::default()
        };
        tweak(&mut cfg);

        let store = SqliteStore::open(&cfg.db_path()).await.unwrap();
        let driver = Arc::new(driver);
        let (events, _) = broadcast::channel(4096);
        let ctx = TaskContext {
            config: Arc::new(cfg),
            store,
            driver: driver.clone(),
            events: events.clone(),
        };
        Self { dir, ctx, driver, events }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join("out").join(name)
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://mock.local/{name}")
    }

    pub fn task(&self, name: &str) -> Arc<DownloadTask> {
        let rec = DownloadRecord::new(&self.url(name), &self.path(name), 1);
        DownloadTask::new(
            Arc::new(parking_lot::Mutex::new(rec)),
            DownloadRequest::from_config(&self.ctx.config),
            self.ctx.clone(),
            None,
        )
    }

    pub async fn engine(&self) -> Engine {
        Engine::with_context(self.ctx.clone()).await.unwrap()
    }
}
