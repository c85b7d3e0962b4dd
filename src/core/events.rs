use crate::core::model::{DownloadRecord, ErrorCode, Status};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Per-request callbacks. Invoked from task and segment tasks, never while
/// the record lock is held.
pub trait DownloadListener: Send + Sync {
    fn on_progress(&self, _info: &DownloadRecord) {}
    fn on_success(&self, _info: &DownloadRecord) {}
    fn on_failure(&self, _info: &DownloadRecord, _code: ErrorCode) {}
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Progress {
        id: String,
        name: String,
        completed: u64,
        total: Option<u64>,
        progress: u8,
        speed: String,
    },
    StatusChanged { id: String, status: Status },
    Finished { id: String, name: String, size: u64 },
    Failed { id: String, name: String, code: ErrorCode },
}

/// Fans one notification out to the request's listener (if any) and to the
/// engine-wide event channel.
#[derive(Clone)]
pub struct Notifier {
    listener: Option<Arc<dyn DownloadListener>>,
    tx: broadcast::Sender<EngineEvent>,
}

impl Notifier {
    pub fn new(listener: Option<Arc<dyn DownloadListener>>, tx: broadcast::Sender<EngineEvent>) -> Self {
        Self { listener, tx }
    }

    pub fn progress(&self, info: &DownloadRecord) {
        if let Some(l) = &self.listener {
            l.on_progress(info);
        }
        let _ = self.tx.send(EngineEvent::Progress {
            id: info.id.clone(),
            name: info.name(),
            completed: info.completed_size,
            total: (info.content_length >= 0).then_some(info.content_length as u64),
            progress: info.progress,
            speed: info.speed.clone(),
        });
    }

    pub fn status(&self, info: &DownloadRecord) {
        if let Some(l) = &self.listener {
            l.on_progress(info);
        }
        let _ = self.tx.send(EngineEvent::StatusChanged { id: info.id.clone(), status: info.status });
    }

    pub fn success(&self, info: &DownloadRecord) {
        if let Some(l) = &self.listener {
            l.on_success(info);
        }
        let _ = self.tx.send(EngineEvent::Finished {
            id: info.id.clone(),
            name: info.name(),
            size: info.completed_size,
        });
    }

    pub fn failure(&self, info: &DownloadRecord, code: ErrorCode) {
        if let Some(l) = &self.listener {
            l.on_failure(info, code);
        }
        let _ = self.tx.send(EngineEvent::Failed { id: info.id.clone(), name: info.name(), code });
    }
}
