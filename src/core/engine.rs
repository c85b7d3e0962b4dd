use crate::config::DownloadConfig;
use crate::core::events::{DownloadListener, EngineEvent, Notifier};
use crate::core::model::{record_id, DownloadRecord, ErrorCode, RecordHandle, Status};
use crate::core::store::SqliteStore;
use crate::core::task::{DownloadRequest, DownloadTask, LifecycleObserver, TaskContext};
use crate::driver::TransferDriver;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-submit knobs. Unset fields fall back to the engine configuration.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    pub tag: Option<String>,
    pub thread_num: Option<usize>,
    pub force_redownload: bool,
    pub disable_resume: bool,
    pub extra: Option<String>,
    pub listener: Option<Arc<dyn DownloadListener>>,
}

#[derive(Debug, Clone)]
pub enum Submitted {
    Queued(String),
    /// A task for this record is already queued or running.
    AlreadyActive(String),
    /// The record finished earlier and the submit was not forced.
    AlreadyExists(DownloadRecord),
}

impl Submitted {
    pub fn id(&self) -> &str {
        match self {
            Submitted::Queued(id) | Submitted::AlreadyActive(id) => id,
            Submitted::AlreadyExists(rec) => &rec.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Downloading,
    Downloaded,
    All,
}

#[derive(Default)]
struct Queues {
    records: HashMap<String, RecordHandle>,
    ready: VecDeque<Arc<DownloadTask>>,
    running: HashMap<String, Arc<DownloadTask>>,
}

impl Queues {
    fn active(&self, id: &str) -> Option<Arc<DownloadTask>> {
        self.running
            .get(id)
            .cloned()
            .or_else(|| self.ready.iter().find(|t| t.id() == id).cloned())
    }

    fn take_queued(&mut self, id: &str) -> Option<Arc<DownloadTask>> {
        let pos = self.ready.iter().position(|t| t.id() == id)?;
        self.ready.remove(pos)
    }
}

/// Admission control and lifecycle for every download of the process.
#[derive(Clone)]
pub struct Engine {
    ctx: TaskContext,
    queues: Arc<Mutex<Queues>>,
    ops: Arc<tokio::sync::Mutex<()>>,
    ready_notify: Arc<Notify>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    dispatcher_started: Arc<AtomicBool>,
    next_create_time: Arc<AtomicI64>,
}

impl Engine {
    pub async fn new(config: DownloadConfig, driver: Arc<dyn TransferDriver>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await
            .with_context(|| format!("create data_dir {}", config.data_dir.display()))?;
        let store = SqliteStore::open(&config.db_path()).await?;
        let (events, _) = broadcast::channel(1024);
        let ctx = TaskContext { config: Arc::new(config), store, driver, events };
        Self::with_context(ctx).await
    }

    /// Loads every stored record. Records left in flight by a previous
    /// process come back as PAUSED.
    pub async fn with_context(ctx: TaskContext) -> anyhow::Result<Self> {
        let records = ctx.store.load_records().await?;
        let mut queues = Queues::default();
        let mut max_create_time = 0;
        for mut rec in records {
            if rec.status.should_stop() && rec.status != Status::Paused {
                debug!(id = %rec.id, from = ?rec.status, "restoring interrupted record as paused");
                rec.status = Status::Paused;
                ctx.store.put_record(&rec).await?;
            }
            rec.calculate_progress();
            max_create_time = max_create_time.max(rec.create_time);
            queues.records.insert(rec.id.clone(), Arc::new(Mutex::new(rec)));
        }
        info!(records = queues.records.len(), driver = ctx.driver.name(), "engine ready");

        let next_create_time = (max_create_time + 1).max(now_millis());
        let permits = ctx.config.max_running_tasks.max(1);
        Ok(Self {
            ctx,
            queues: Arc::new(Mutex::new(queues)),
            ops: Arc::new(tokio::sync::Mutex::new(())),
            ready_notify: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(permits)),
            shutdown: CancellationToken::new(),
            dispatcher_started: Arc::new(AtomicBool::new(false)),
            next_create_time: Arc::new(AtomicI64::new(next_create_time)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.ctx.config
    }

    pub async fn submit(&self, url: &str, path: &Path, opts: SubmitOptions) -> anyhow::Result<Submitted> {
        let _op = self.ops.lock().await;
        let id = record_id(url, path);
        let handle = {
            let mut q = self.queues.lock();
            if q.active(&id).is_some() {
                debug!(%id, "already queued or running");
                return Ok(Submitted::AlreadyActive(id));
            }
            q.records
                .entry(id.clone())
                .or_insert_with(|| {
                    let created = self.next_create_time.fetch_add(1, Ordering::SeqCst);
                    Arc::new(Mutex::new(DownloadRecord::new(url, path, created)))
                })
                .clone()
        };
        self.enqueue(handle, opts, false).await
    }

    /// Re-submits a stored record. A finished record is revalidated with the
    /// server instead of being rejected.
    pub async fn restart(&self, id: &str) -> anyhow::Result<Submitted> {
        let _op = self.ops.lock().await;
        let handle = {
            let q = self.queues.lock();
            if q.active(id).is_some() {
                return Ok(Submitted::AlreadyActive(id.to_string()));
            }
            q.records.get(id).cloned()
        };
        let handle = handle.with_context(|| format!("no download with id {id}"))?;
        self.enqueue(handle, SubmitOptions::default(), true).await
    }

    async fn enqueue(&self, handle: RecordHandle, opts: SubmitOptions, restart: bool) -> anyhow::Result<Submitted> {
        anyhow::ensure!(!self.shutdown.is_cancelled(), "engine is shut down");
        let cfg = &self.ctx.config;
        let force = opts.force_redownload || cfg.force_redownload;

        let (already, output) = {
            let mut rec = handle.lock();
            if let Some(tag) = &opts.tag {
                rec.tag = tag.clone();
            }
            if opts.extra.is_some() {
                rec.extra = opts.extra.clone();
            }
            rec.disable_resume = opts.disable_resume || cfg.disable_breakpoint;
            rec.error_code = None;

            if !restart && rec.finished && !force {
                (Some(rec.clone()), None)
            } else {
                if !restart {
                    if rec.finished {
                        rec.finished = false;
                        rec.completed_size = 0;
                    }
                    rec.status = Status::Stopped;
                }
                rec.calculate_progress();
                (None, (!restart).then(|| rec.file_path.clone()))
            }
        };

        if let Some(rec) = already {
            info!(id = %rec.id, "already downloaded");
            Notifier::new(opts.listener.clone(), self.ctx.events.clone()).failure(&rec, ErrorCode::AlreadyExists);
            return Ok(Submitted::AlreadyExists(rec));
        }
        if let Some(output) = output {
            if let Err(e) = tokio::fs::remove_file(&output).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %output.display(), "remove stale output failed: {e}");
                }
            }
        }

        let request = DownloadRequest {
            thread_num: opts.thread_num.unwrap_or(cfg.thread_num).max(1),
            force_redownload: force,
            retry_count: cfg.retry_count,
            retry_delay: cfg.retry_delay(),
        };
        let task = DownloadTask::new(handle, request, self.ctx.clone(), opts.listener);
        task.update_info().await;
        let id = task.id().to_string();
        info!(%id, url = %task.snapshot().url, "queued");

        self.queues.lock().ready.push_back(task);
        self.ready_notify.notify_one();
        self.ensure_dispatcher();
        Ok(Submitted::Queued(id))
    }

    pub async fn pause(&self, id: &str) -> anyhow::Result<()> {
        let (queued, running) = {
            let mut q = self.queues.lock();
            anyhow::ensure!(q.records.contains_key(id), "no download with id {id}");
            (q.take_queued(id), q.running.get(id).cloned())
        };
        if let Some(task) = queued {
            self.settle_queued(&task, Status::Paused).await;
        }
        if let Some(task) = running {
            task.pause();
        }
        Ok(())
    }

    /// Stops the download and blocks resuming it for the rest of this
    /// process run.
    pub async fn stop(&self, id: &str) -> anyhow::Result<()> {
        let (handle, queued, running) = {
            let mut q = self.queues.lock();
            let handle = q.records.get(id).cloned().with_context(|| format!("no download with id {id}"))?;
            (handle, q.take_queued(id), q.running.get(id).cloned())
        };
        handle.lock().resume_blocked = true;
        if let Some(task) = queued {
            self.settle_queued(&task, Status::Stopped).await;
        }
        if let Some(task) = running {
            task.stop();
        }
        Ok(())
    }

    /// Removes the record, its output, its temp dir and its validator once
    /// any running task has terminated.
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let _op = self.ops.lock().await;
        let (handle, queued, running) = {
            let mut q = self.queues.lock();
            let handle = q.records.remove(id).with_context(|| format!("no download with id {id}"))?;
            (handle, q.take_queued(id), q.running.get(id).cloned())
        };
        if let Some(task) = queued {
            task.delete();
            task.discard();
        }
        if let Some(task) = running {
            task.delete();
            task.wait_done().await;
        }

        let (output, temp_dir) = {
            let mut rec = handle.lock();
            rec.status = Status::Deleted;
            (rec.file_path.clone(), rec.temp_dir())
        };
        if let Err(e) = tokio::fs::remove_file(&output).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %output.display(), "remove output failed: {e}");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp_dir.display(), "remove temp dir failed: {e}");
            }
        }
        self.ctx.store.delete_record(id).await?;
        self.ctx.store.delete_validator(id).await?;
        info!(%id, "deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        let handle = self.queues.lock().records.get(id).cloned();
        handle.map(|h| h.lock().clone())
    }

    /// Snapshots ordered by creation time.
    pub fn list(&self, filter: ListFilter) -> Vec<DownloadRecord> {
        let handles: Vec<RecordHandle> = self.queues.lock().records.values().cloned().collect();
        let mut out: Vec<DownloadRecord> = handles
            .iter()
            .map(|h| h.lock().clone())
            .filter(|r| match filter {
                ListFilter::Downloading => !r.finished,
                ListFilter::Downloaded => r.finished,
                ListFilter::All => true,
            })
            .collect();
        out.sort_by_key(|r| r.create_time);
        out
    }

    pub fn running_count(&self) -> usize {
        self.queues.lock().running.len()
    }

    /// Resolves once the record has no queued or running task.
    pub async fn wait(&self, id: &str) -> Option<DownloadRecord> {
        let task = self.queues.lock().active(id);
        if let Some(task) = task.filter(|t| !t.is_done()) {
            task.wait_done().await;
        }
        self.get(id)
    }

    /// Stops dispatching, pauses running tasks, stops queued ones and waits
    /// for running tasks to record their final state.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let (queued, running): (Vec<_>, Vec<_>) = {
            let mut q = self.queues.lock();
            (q.ready.drain(..).collect(), q.running.values().cloned().collect())
        };
        info!(queued = queued.len(), running = running.len(), "shutting down");
        for task in &queued {
            self.settle_queued(task, Status::Stopped).await;
        }
        for task in &running {
            task.pause();
        }
        for task in &running {
            task.wait_done().await;
        }
    }

    /// Terminal bookkeeping for a task pulled out of the ready queue.
    async fn settle_queued(&self, task: &Arc<DownloadTask>, status: Status) {
        let snapshot = {
            let mut rec = task.record().lock();
            rec.status = status;
            rec.clone()
        };
        task.update_info().await;
        task.notifier().status(&snapshot);
        task.discard();
        debug!(id = %task.id(), ?status, "removed from ready queue");
    }

    fn ensure_dispatcher(&self) {
        if self.dispatcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.dispatch_loop().await });
    }

    async fn dispatch_loop(self) {
        debug!("dispatcher started");
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                p = self.permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                t = self.take_ready() => t,
            };

            let engine = self.clone();
            tokio::spawn(async move {
                task.run(&engine).await;
                drop(permit);
            });
        }
        debug!("dispatcher stopped");
    }

    /// Next ready task, moved into the running set under the same lock so a
    /// concurrent submit always sees it.
    async fn take_ready(&self) -> Arc<DownloadTask> {
        loop {
            {
                let mut q = self.queues.lock();
                if let Some(task) = q.ready.pop_front() {
                    q.running.insert(task.id().to_string(), task.clone());
                    return task;
                }
            }
            self.ready_notify.notified().await;
        }
    }
}

impl LifecycleObserver for Engine {
    fn on_download_start(&self, task: &Arc<DownloadTask>) {
        self.queues.lock().running.insert(task.id().to_string(), task.clone());
    }

    fn on_download_end(&self, task: &Arc<DownloadTask>) {
        let mut q = self.queues.lock();
        if q.running.get(task.id()).is_some_and(|t| Arc::ptr_eq(t, task)) {
            q.running.remove(task.id());
        }
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::Fixture;
    use crate::driver::mock::{sample_body, MockDriver};
    use std::time::Duration;

    async fn settle(engine: &Engine, id: &str) -> DownloadRecord {
        tokio::time::timeout(Duration::from_secs(20), engine.wait(id))
            .await
            .expect("download did not settle")
            .expect("record missing")
    }

    async fn until_bytes(engine: &Engine, id: &str, min: u64) {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if engine.get(id).map(|r| r.completed_size >= min).unwrap_or(false) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no progress");
    }

    fn single_thread() -> SubmitOptions {
        SubmitOptions { thread_num: Some(1), ..Default::default() }
    }

    #[tokio::test]
    async fn submit_is_idempotent_while_active() {
        let body = sample_body(40_000);
        let driver = MockDriver::new(body.clone()).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::new(driver).await;
        let engine = fx.engine().await;
        let path = fx.path("twice.bin");

        let first = engine.submit(&fx.url("twice.bin"), &path, SubmitOptions::default()).await.unwrap();
        let second = engine.submit(&fx.url("twice.bin"), &path, SubmitOptions::default()).await.unwrap();
        assert!(matches!(first, Submitted::Queued(_)));
        assert!(matches!(second, Submitted::AlreadyActive(_)));
        assert_eq!(first.id(), second.id());

        let rec = settle(&engine, first.id()).await;
        assert_eq!(rec.status, Status::Finished);
        assert_eq!(fx.driver.connects(), 3);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
    }

    #[tokio::test]
    async fn finished_record_is_not_downloaded_again() {
        let fx = Fixture::new(MockDriver::new(sample_body(4096))).await;
        let engine = fx.engine().await;
        let path = fx.path("done.bin");
        let mut events = engine.subscribe();

        let id = engine.submit(&fx.url("done.bin"), &path, SubmitOptions::default()).await.unwrap();
        settle(&engine, id.id()).await;
        let connects = fx.driver.connects();

        let again = engine.submit(&fx.url("done.bin"), &path, SubmitOptions::default()).await.unwrap();
        assert!(matches!(again, Submitted::AlreadyExists(_)));
        assert_eq!(fx.driver.connects(), connects);

        let mut saw_exists = false;
        while let Ok(evt) = events.try_recv() {
            if let EngineEvent::Failed { code: ErrorCode::AlreadyExists, .. } = evt {
                saw_exists = true;
            }
        }
        assert!(saw_exists);

        let forced = SubmitOptions { force_redownload: true, ..Default::default() };
        let again = engine.submit(&fx.url("done.bin"), &path, forced).await.unwrap();
        assert!(matches!(again, Submitted::Queued(_)));
        assert_eq!(settle(&engine, again.id()).await.status, Status::Finished);
    }

    #[tokio::test]
    async fn resume_transfers_only_the_missing_bytes() {
        let body = sample_body(200_000);
        let driver = MockDriver::new(body.clone()).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::new(driver).await;
        let engine = fx.engine().await;
        let path = fx.path("resume.bin");

        let id = engine.submit(&fx.url("resume.bin"), &path, single_thread()).await.unwrap();
        until_bytes(&engine, id.id(), 20_000).await;
        engine.pause(id.id()).await.unwrap();
        let paused = settle(&engine, id.id()).await;
        assert_eq!(paused.status, Status::Paused);
        assert_eq!(paused.error_code, None);

        let on_disk = tokio::fs::metadata(paused.part_path(0)).await.unwrap().len();
        assert!(on_disk >= 20_000 && on_disk < 200_000);

        fx.driver.reset_served();
        fx.driver.set_chunk_delay(Duration::ZERO);
        let again = engine.submit(&fx.url("resume.bin"), &path, single_thread()).await.unwrap();
        let rec = settle(&engine, again.id()).await;

        assert_eq!(rec.status, Status::Finished);
        assert_eq!(rec.completed_size, 200_000);
        assert_eq!(fx.driver.served(), 200_000 - on_disk);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        let last = fx.driver.requests().pop().unwrap();
        assert_eq!(last.get_header("Range"), Some(format!("bytes={on_disk}-").as_str()));
    }

    #[tokio::test]
    async fn segmented_resume_fetches_only_what_is_missing() {
        let body = sample_body(300_000);
        let driver = MockDriver::new(body.clone())
            .with_chunk_size(4096)
            .with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::new(driver).await;
        let engine = fx.engine().await;
        let path = fx.path("segmented.bin");

        let id = engine.submit(&fx.url("segmented.bin"), &path, SubmitOptions::default()).await.unwrap();
        until_bytes(&engine, id.id(), 60_000).await;
        engine.pause(id.id()).await.unwrap();
        let paused = settle(&engine, id.id()).await;
        assert_eq!(paused.status, Status::Paused);
        assert_eq!(paused.thread_num, 3);

        let mut on_disk = 0;
        for i in 0..3 {
            on_disk += tokio::fs::metadata(paused.part_path(i)).await.unwrap().len();
        }
        assert!(on_disk >= 60_000 && on_disk < 300_000);
        let part0 = tokio::fs::metadata(paused.part_path(0)).await.unwrap().len();

        fx.driver.reset_served();
        fx.driver.set_chunk_delay(Duration::ZERO);
        let before = fx.driver.requests().len();
        let again = engine.submit(&fx.url("segmented.bin"), &path, SubmitOptions::default()).await.unwrap();
        let rec = settle(&engine, again.id()).await;

        assert_eq!(rec.status, Status::Finished);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        let resumed = &fx.driver.requests()[before];
        assert_eq!(resumed.get_header("Range"), Some(format!("bytes={part0}-").as_str()));
        // The reused open-ended response may run past segment 0 by less than a chunk.
        let missing = 300_000 - on_disk;
        let served = fx.driver.served();
        assert!(served >= missing && served < missing + 4096, "served {served}, missing {missing}");
    }

    #[tokio::test]
    async fn not_modified_keeps_the_finished_file() {
        let body = sample_body(8192);
        let fx = Fixture::new(MockDriver::new(body.clone())).await;
        let engine = fx.engine().await;
        let path = fx.path("fresh.bin");

        let id = engine.submit(&fx.url("fresh.bin"), &path, SubmitOptions::default()).await.unwrap();
        settle(&engine, id.id()).await;
        fx.driver.reset_served();
        let connects = fx.driver.connects();

        engine.restart(id.id()).await.unwrap();
        let rec = settle(&engine, id.id()).await;

        assert_eq!(rec.status, Status::Finished);
        assert_eq!(rec.progress, 100);
        assert_eq!(rec.completed_size, 8192);
        assert_eq!(fx.driver.served(), 0);
        assert_eq!(fx.driver.connects(), connects + 1);
        let last = fx.driver.requests().pop().unwrap();
        assert_eq!(last.get_header("If-None-Match"), Some("\"v1\""));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
    }

    #[tokio::test]
    async fn network_failure_is_retried_three_times() {
        let fx = Fixture::new(MockDriver::new(sample_body(100)).failing()).await;
        let engine = fx.engine().await;
        let mut events = engine.subscribe();

        let id = engine.submit(&fx.url("down.bin"), &fx.path("down.bin"), SubmitOptions::default()).await.unwrap();
        let rec = settle(&engine, id.id()).await;

        assert_eq!(fx.driver.connects(), 4);
        assert_eq!(rec.status, Status::Failed);
        assert_eq!(rec.error_code, Some(ErrorCode::NetworkUnavailable));
        let failures = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, EngineEvent::Failed { .. }))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn at_most_three_tasks_run_at_once() {
        let body = sample_body(16 * 1024);
        let driver = MockDriver::new(body.clone()).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::new(driver).await;
        let engine = fx.engine().await;

        let mut ids = vec![];
        for i in 0..10 {
            let name = format!("f{i}.bin");
            let s = engine.submit(&fx.url(&name), &fx.path(&name), single_thread()).await.unwrap();
            ids.push(s.id().to_string());
        }
        for id in &ids {
            assert_eq!(settle(&engine, id).await.status, Status::Finished);
        }
        assert_eq!(fx.driver.max_open(), 3);
        assert_eq!(engine.running_count(), 0);
        assert_eq!(engine.list(ListFilter::Downloaded).len(), 10);
    }

    #[tokio::test]
    async fn pausing_a_queued_task_takes_it_off_the_queue() {
        let driver = MockDriver::new(sample_body(64 * 1024)).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::with_config(driver, |c| c.max_running_tasks = 1).await;
        let engine = fx.engine().await;

        let a = engine.submit(&fx.url("a.bin"), &fx.path("a.bin"), single_thread()).await.unwrap();
        let b = engine.submit(&fx.url("b.bin"), &fx.path("b.bin"), single_thread()).await.unwrap();
        engine.pause(b.id()).await.unwrap();

        assert_eq!(engine.get(b.id()).unwrap().status, Status::Paused);
        assert_eq!(settle(&engine, a.id()).await.status, Status::Finished);
        assert_eq!(settle(&engine, b.id()).await.status, Status::Paused);
        assert!(fx.driver.requests().iter().all(|r| !r.url.ends_with("b.bin")));
    }

    #[tokio::test]
    async fn stop_blocks_resume_for_this_run() {
        let body = sample_body(100_000);
        let driver = MockDriver::new(body.clone()).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::with_config(driver, |c| c.thread_num = 1).await;
        let engine = fx.engine().await;
        let path = fx.path("stop.bin");

        let id = engine.submit(&fx.url("stop.bin"), &path, SubmitOptions::default()).await.unwrap();
        until_bytes(&engine, id.id(), 10_000).await;
        engine.stop(id.id()).await.unwrap();
        let rec = settle(&engine, id.id()).await;
        assert_eq!(rec.status, Status::Stopped);
        assert!(rec.resume_blocked);

        fx.driver.reset_served();
        fx.driver.set_chunk_delay(Duration::ZERO);
        engine.restart(id.id()).await.unwrap();
        let rec = settle(&engine, id.id()).await;
        assert_eq!(rec.status, Status::Finished);
        assert_eq!(fx.driver.served(), 100_000);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
    }

    #[tokio::test]
    async fn delete_removes_every_trace() {
        let driver = MockDriver::new(sample_body(200_000)).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::new(driver).await;
        let engine = fx.engine().await;
        let path = fx.path("gone.bin");

        let id = engine.submit(&fx.url("gone.bin"), &path, SubmitOptions::default()).await.unwrap();
        let temp_dir = engine.get(id.id()).unwrap().temp_dir();
        until_bytes(&engine, id.id(), 10_000).await;
        engine.delete(id.id()).await.unwrap();

        assert!(engine.get(id.id()).is_none());
        assert!(!path.exists());
        assert!(!temp_dir.exists());
        assert!(fx.ctx.store.get_record(id.id()).await.unwrap().is_none());
        assert!(fx.ctx.store.get_validator(id.id()).await.unwrap().is_none());
        assert!(engine.delete(id.id()).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_pauses_running_downloads() {
        let driver = MockDriver::new(sample_body(200_000)).with_chunk_delay(Duration::from_millis(2));
        let fx = Fixture::new(driver).await;
        let engine = fx.engine().await;

        let id = engine.submit(&fx.url("s.bin"), &fx.path("s.bin"), SubmitOptions::default()).await.unwrap();
        until_bytes(&engine, id.id(), 5_000).await;
        engine.shutdown().await;

        assert_eq!(engine.get(id.id()).unwrap().status, Status::Paused);
        assert_eq!(fx.ctx.store.get_record(id.id()).await.unwrap().unwrap().status, Status::Paused);
        assert!(engine.submit(&fx.url("t.bin"), &fx.path("t.bin"), SubmitOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_records_come_back_paused() {
        let fx = Fixture::new(MockDriver::new(vec![])).await;
        let mut rec = DownloadRecord::new(&fx.url("old.bin"), &fx.path("old.bin"), 5);
        rec.status = Status::Running;
        rec.content_length = 100;
        rec.completed_size = 40;
        fx.ctx.store.put_record(&rec).await.unwrap();

        let engine = fx.engine().await;
        let loaded = engine.get(&rec.id).unwrap();
        assert_eq!(loaded.status, Status::Paused);
        assert_eq!(loaded.progress, 40);
        assert_eq!(engine.list(ListFilter::Downloading).len(), 1);
        assert!(engine.list(ListFilter::Downloaded).is_empty());

        let submitted = engine.submit(&fx.url("new.bin"), &fx.path("new.bin"), SubmitOptions::default()).await.unwrap();
        let all = engine.list(ListFilter::All);
        assert_eq!(all.last().unwrap().id, submitted.id());
        assert!(all[1].create_time > all[0].create_time);
    }
}
