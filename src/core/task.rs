use crate::config::DownloadConfig;
use crate::core::chain::{default_interceptors, DownloadChain};
use crate::core::events::{DownloadListener, EngineEvent, Notifier};
use crate::core::model::{DownloadRecord, ErrorCode, RecordHandle, Status};
use crate::core::speed::SpeedMonitor;
use crate::core::store::SqliteStore;
use crate::driver::TransferDriver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Services shared by the engine and every task it runs.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<DownloadConfig>,
    pub store: SqliteStore,
    pub driver: Arc<dyn TransferDriver>,
    pub events: broadcast::Sender<EngineEvent>,
}

/// Per-submit parameters, fixed for the lifetime of one task.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub thread_num: usize,
    pub force_redownload: bool,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl DownloadRequest {
    pub fn from_config(cfg: &DownloadConfig) -> Self {
        Self {
            thread_num: cfg.thread_num.max(1),
            force_redownload: cfg.force_redownload,
            retry_count: cfg.retry_count,
            retry_delay: cfg.retry_delay(),
        }
    }
}

/// Running-set and permit bookkeeping hooks, called by the task itself.
pub trait LifecycleObserver: Send + Sync {
    fn on_download_start(&self, task: &Arc<DownloadTask>);
    fn on_download_end(&self, task: &Arc<DownloadTask>);
}

#[derive(Default)]
struct Meters {
    speed: SpeedMonitor,
    last_progress: u8,
}

pub struct DownloadTask {
    id: String,
    record: RecordHandle,
    request: DownloadRequest,
    ctx: TaskContext,
    notifier: Notifier,
    cancel: CancellationToken,
    meters: Mutex<Meters>,
    stopped: AtomicBool,
    need_delete: AtomicBool,
    destroyed: AtomicBool,
    done: watch::Sender<bool>,
}

impl DownloadTask {
    pub fn new(
        record: RecordHandle,
        request: DownloadRequest,
        ctx: TaskContext,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Arc<Self> {
        let notifier = Notifier::new(listener, ctx.events.clone());
        let (snapshot, last_progress) = {
            let mut rec = record.lock();
            rec.status = Status::Wait;
            rec.calculate_progress();
            (rec.clone(), rec.progress)
        };
        let (done, _) = watch::channel(false);
        let task = Arc::new(Self {
            id: snapshot.id.clone(),
            record,
            request,
            ctx,
            notifier,
            cancel: CancellationToken::new(),
            meters: Mutex::new(Meters { last_progress, ..Default::default() }),
            stopped: AtomicBool::new(false),
            need_delete: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            done,
        });
        task.notifier.status(&snapshot);
        task
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn record(&self) -> &RecordHandle {
        &self.record
    }

    pub fn snapshot(&self) -> DownloadRecord {
        self.record.lock().clone()
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn ctx(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn run(self: &Arc<Self>, observer: &dyn LifecycleObserver) {
        {
            let mut rec = self.record.lock();
            if !self.stopped.load(Ordering::SeqCst) && rec.status == Status::Wait {
                rec.status = Status::Running;
            }
        }
        observer.on_download_start(self);
        info!(id = %self.id, "download started");

        if !self.should_stop() {
            let interceptors = default_interceptors();
            if let Err(e) = DownloadChain::new(&interceptors, self).proceed().await {
                error!(id = %self.id, "download chain failed: {e:#}");
                self.set_error(ErrorCode::DownloadFailed);
            }
        }

        self.finish_run().await;
        self.destroyed.store(true, Ordering::SeqCst);
        observer.on_download_end(self);
        self.done.send_replace(true);
    }

    /// Settles the terminal status once the chain has returned.
    async fn finish_run(&self) {
        enum Outcome {
            Quiet,
            Status,
            Failure(ErrorCode),
        }

        let need_delete = self.need_delete.load(Ordering::SeqCst);
        let (snapshot, outcome) = {
            let mut rec = self.record.lock();
            rec.speed.clear();
            let outcome = if need_delete {
                rec.status = Status::Deleted;
                Outcome::Status
            } else if self.stopped.load(Ordering::SeqCst) {
                rec.status = Status::Stopped;
                Outcome::Status
            } else {
                match rec.status {
                    Status::Finished => Outcome::Quiet,
                    s if s.is_canceled() => {
                        rec.status = Status::Paused;
                        Outcome::Status
                    }
                    _ => match rec.error_code {
                        Some(code) => {
                            rec.status = Status::Failed;
                            Outcome::Failure(code)
                        }
                        None if self.cancel.is_cancelled() => {
                            rec.status = Status::Paused;
                            Outcome::Status
                        }
                        None => {
                            rec.status = Status::Stopped;
                            Outcome::Status
                        }
                    },
                }
            };
            (rec.clone(), outcome)
        };

        match outcome {
            Outcome::Quiet => {}
            Outcome::Status => {
                self.update_info().await;
                info!(id = %self.id, status = ?snapshot.status, "download ended");
                self.notifier.status(&snapshot);
            }
            Outcome::Failure(code) => {
                self.update_info().await;
                warn!(id = %self.id, %code, "download failed");
                self.notifier.failure(&snapshot, code);
            }
        }
    }

    /// Called from segment tasks after each chunk lands on disk.
    pub fn on_segment_bytes(&self, n: u64) {
        let snapshot = {
            let mut rec = self.record.lock();
            rec.completed_size += n;
            if rec.content_length >= 0 {
                rec.completed_size = rec.completed_size.min(rec.content_length as u64);
            }
            let mut meters = self.meters.lock();
            meters.speed.compute(n);
            rec.speed = meters.speed.speed();
            if rec.content_length <= 0 {
                return;
            }
            rec.calculate_progress();
            if rec.progress == meters.last_progress {
                return;
            }
            meters.last_progress = rec.progress;
            // 100% is reported once, by the merge stage.
            if rec.progress == 100 {
                return;
            }
            rec.clone()
        };
        self.notifier.progress(&snapshot);
    }

    /// Seeds completed bytes with what the part files already hold.
    pub fn set_initial_completed(&self, completed: u64) {
        let mut rec = self.record.lock();
        rec.completed_size = completed;
        if rec.content_length >= 0 {
            rec.completed_size = rec.completed_size.min(rec.content_length as u64);
        }
        rec.calculate_progress();
        self.meters.lock().last_progress = rec.progress;
    }

    pub fn pause(&self) {
        let snapshot = {
            let mut rec = self.record.lock();
            if self.destroyed.load(Ordering::SeqCst) || !rec.status.is_running() {
                return;
            }
            rec.status = Status::Pausing;
            rec.clone()
        };
        debug!(id = %self.id, "pausing");
        self.notifier.status(&snapshot);
        self.cancel.cancel();
    }

    pub fn stop(&self) {
        {
            let mut rec = self.record.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            self.stopped.store(true, Ordering::SeqCst);
            rec.status = Status::Stopped;
            rec.resume_blocked = true;
        }
        debug!(id = %self.id, "stopping");
        self.cancel.cancel();
    }

    pub fn delete(&self) {
        {
            let _rec = self.record.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            self.need_delete.store(true, Ordering::SeqCst);
        }
        debug!(id = %self.id, "deleting");
        self.cancel.cancel();
    }

    /// Ends a task that never left the ready queue.
    pub fn discard(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.done.send_replace(true);
    }

    pub fn should_stop(&self) -> bool {
        self.record.lock().status != Status::Running
            || self.stopped.load(Ordering::SeqCst)
            || self.need_delete.load(Ordering::SeqCst)
            || self.cancel.is_cancelled()
    }

    /// Cancellation is never an error: codes raised while pausing,
    /// stopping or deleting are dropped.
    pub fn set_error(&self, code: ErrorCode) {
        let mut rec = self.record.lock();
        if rec.status == Status::Pausing || self.cancel.is_cancelled() {
            return;
        }
        if rec.error_code.is_none() {
            debug!(id = %self.id, %code, "error recorded");
        }
        rec.error_code = Some(code);
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.record.lock().error_code
    }

    pub fn prepare_retry(&self) {
        let mut rec = self.record.lock();
        if rec.status == Status::Pausing || self.cancel.is_cancelled() {
            return;
        }
        rec.status = Status::Running;
        rec.error_code = None;
    }

    /// Terminal success: called by the merge stage and the 304 fast path.
    pub async fn mark_finished(&self, content_length: u64) {
        let snapshot = {
            let mut rec = self.record.lock();
            rec.content_length = content_length as i64;
            rec.completed_size = content_length;
            rec.progress = 100;
            rec.finished = true;
            rec.error_code = None;
            rec.status = Status::Finished;
            rec.clone()
        };
        self.update_info().await;
        info!(id = %self.id, size = content_length, "download finished");
        self.notifier.success(&snapshot);
    }

    /// Persists the record unless a delete is pending.
    pub async fn update_info(&self) {
        if self.need_delete.load(Ordering::SeqCst) {
            return;
        }
        let snapshot = self.snapshot();
        if let Err(e) = self.ctx.store.put_record(&snapshot).await {
            warn!(id = %self.id, "persist record failed: {e:#}");
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}
