use crate::core::model::{CacheValidator, ErrorCode, SegmentRange};
use crate::core::task::DownloadTask;
use crate::driver::{connect_cancelable, read_cancelable, Connection, DriverError, DriverRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

enum BlockError {
    Canceled,
    Failed(ErrorCode),
}

/// Downloads one byte range into its `part-<index>` file, appending to
/// whatever a previous attempt left there.
pub struct BlockTask {
    task: Arc<DownloadTask>,
    segment: SegmentRange,
    part_path: PathBuf,
    content_length: i64,
    validator: Option<CacheValidator>,
    cancel: CancellationToken,
}

impl BlockTask {
    /// `cancel` is shared by all segments of one attempt so a failing
    /// segment can bring its siblings down.
    pub fn new(
        task: Arc<DownloadTask>,
        segment: SegmentRange,
        content_length: i64,
        validator: Option<CacheValidator>,
        cancel: CancellationToken,
    ) -> Self {
        let part_path = task.record().lock().part_path(segment.index);
        Self { task, segment, part_path, content_length, validator, cancel }
    }

    pub fn index(&self) -> usize {
        self.segment.index
    }

    /// Bytes already on disk for this segment.
    pub async fn completed_size(&self) -> u64 {
        tokio::fs::metadata(&self.part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn clear_temp(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(part = %self.part_path.display(), "clear temp failed: {e}");
            }
        }
    }

    /// Runs the segment to completion. Failures land on the task as error
    /// codes; cancellation leaves no trace.
    pub async fn run(&self, conn: Option<Box<dyn Connection>>) {
        match self.download(conn).await {
            Ok(()) => debug!(id = %self.task.id(), segment = self.index(), "segment complete"),
            Err(BlockError::Canceled) => debug!(id = %self.task.id(), segment = self.index(), "segment canceled"),
            Err(BlockError::Failed(code)) => {
                warn!(id = %self.task.id(), segment = self.index(), %code, "segment failed");
                self.task.set_error(code);
                self.cancel.cancel();
            }
        }
    }

    async fn download(&self, conn: Option<Box<dyn Connection>>) -> Result<(), BlockError> {
        let done = self.completed_size().await;
        let mut remaining = self.segment.len(self.content_length).map(|l| l.saturating_sub(done));
        if remaining == Some(0) {
            return Ok(());
        }

        let mut conn = match conn {
            Some(c) => c,
            None => self.open(done).await?,
        };

        if let Some(parent) = self.part_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_failure(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.part_path)
            .await
            .map_err(|e| self.io_failure(e))?;

        let pumped = self.pump(conn.as_mut(), &mut file, &mut remaining).await;
        // Land buffered bytes even when canceled so the part length is exact.
        file.flush().await.map_err(|e| self.io_failure(e))?;
        pumped?;

        match remaining {
            Some(r) if r > 0 => {
                warn!(id = %self.task.id(), segment = self.index(), missing = r, "body ended early");
                Err(BlockError::Failed(ErrorCode::NetworkUnavailable))
            }
            _ => Ok(()),
        }
    }

    async fn pump(
        &self,
        conn: &mut dyn Connection,
        file: &mut tokio::fs::File,
        remaining: &mut Option<u64>,
    ) -> Result<(), BlockError> {
        loop {
            if self.task.should_stop() || self.cancel.is_cancelled() {
                return Err(BlockError::Canceled);
            }
            let chunk = match read_cancelable(conn, &self.cancel).await {
                Ok(Some(c)) => c,
                Ok(None) => return Ok(()),
                Err(DriverError::Canceled) => return Err(BlockError::Canceled),
                Err(_) if self.cancel.is_cancelled() => return Err(BlockError::Canceled),
                Err(e) => {
                    warn!(id = %self.task.id(), segment = self.index(), "read failed: {e}");
                    return Err(BlockError::Failed(ErrorCode::NetworkUnavailable));
                }
            };

            let take = match *remaining {
                Some(r) => r.min(chunk.len() as u64) as usize,
                None => chunk.len(),
            };
            file.write_all(&chunk[..take]).await.map_err(|e| self.io_failure(e))?;
            self.task.on_segment_bytes(take as u64);

            if let Some(r) = remaining.as_mut() {
                *r -= take as u64;
                if *r == 0 {
                    return Ok(());
                }
            }
        }
    }

    async fn open(&self, done: u64) -> Result<Box<dyn Connection>, BlockError> {
        let start = self.segment.start + done;
        let range = match self.segment.end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        let url = self.task.record().lock().url.clone();
        let mut req = DriverRequest::new(&url).header("Range", range);
        if let Some(v) = self.validator.as_ref().and_then(|v| v.if_range_value()) {
            req = req.header("If-Range", v);
        }

        let driver = self.task.ctx().driver.clone();
        let conn = match connect_cancelable(driver.as_ref(), &req, &self.cancel).await {
            Ok(c) => c,
            Err(DriverError::Canceled) => return Err(BlockError::Canceled),
            Err(_) if self.cancel.is_cancelled() => return Err(BlockError::Canceled),
            Err(e) => {
                warn!(id = %self.task.id(), segment = self.index(), "connect failed: {e}");
                return Err(BlockError::Failed(ErrorCode::NetworkUnavailable));
            }
        };

        match conn.status() {
            206 => Ok(conn),
            s if s >= 400 => Err(BlockError::Failed(ErrorCode::UnknownServerError)),
            s => {
                warn!(id = %self.task.id(), segment = self.index(), status = s, "range request not honoured");
                Err(BlockError::Failed(ErrorCode::DownloadFailed))
            }
        }
    }

    fn io_failure(&self, e: std::io::Error) -> BlockError {
        warn!(part = %self.part_path.display(), "part file i/o failed: {e}");
        BlockError::Failed(ErrorCode::DownloadFailed)
    }
}
