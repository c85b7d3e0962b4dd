use crate::core::assembler::merge_parts;
use crate::core::chain::{DownloadChain, Interceptor};
use crate::core::model::{DownloadRecord, ErrorCode};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Joins the part files into the output once every segment has completed.
pub struct MergeInterceptor;

#[async_trait]
impl Interceptor for MergeInterceptor {
    fn name(&self) -> &'static str {
        "merge"
    }

    async fn intercept(&self, chain: &DownloadChain<'_>) -> anyhow::Result<DownloadRecord> {
        let task = chain.task();
        if task.should_stop() || task.error_code().is_some() {
            return Ok(task.snapshot());
        }

        let rec = task.snapshot();
        let parts: Vec<PathBuf> = (0..rec.thread_num).map(|i| rec.part_path(i)).collect();
        let size = match merge_parts(&parts, &rec.file_path).await {
            Ok(size) => size,
            Err(e) => {
                warn!(id = %rec.id, "merge failed: {e:#}");
                task.set_error(ErrorCode::DownloadFailed);
                return Ok(task.snapshot());
            }
        };

        let temp_dir = rec.temp_dir();
        if rec.content_length >= 0 && size != rec.content_length as u64 {
            warn!(id = %rec.id, size, expected = rec.content_length, "merged size mismatch, dropping parts");
            if let Err(e) = tokio::fs::remove_file(&rec.file_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %rec.file_path.display(), "remove output failed: {e}");
                }
            }
            remove_temp_dir(&temp_dir).await;
            task.set_error(ErrorCode::DownloadFailed);
            return Ok(task.snapshot());
        }

        remove_temp_dir(&temp_dir).await;
        info!(id = %rec.id, parts = parts.len(), size, "merged");
        task.mark_finished(size).await;
        chain.proceed().await
    }
}

async fn remove_temp_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), "remove temp dir failed: {e}");
        }
    }
}
