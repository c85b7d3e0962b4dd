use crate::config::DownloadConfig;
use crate::core::block::BlockTask;
use crate::core::chain::{DownloadChain, Interceptor};
use crate::core::model::{CacheValidator, DownloadRecord, ErrorCode, CONTENT_LENGTH_NOT_FOUND, PART_PREFIX};
use crate::core::planner::plan_segments;
use crate::core::task::DownloadTask;
use crate::driver::{connect_cancelable, Connection, DriverError, DriverRequest};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tracing::{debug, info, warn};

/// Negotiates the transfer with the server, decides whether the download can
/// resume and how many segments it gets, then runs the segments to
/// completion before handing over to the next stage.
pub struct ConnectInterceptor;

#[async_trait]
impl Interceptor for ConnectInterceptor {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn intercept(&self, chain: &DownloadChain<'_>) -> anyhow::Result<DownloadRecord> {
        let task = chain.task();
        let ctx = task.ctx();
        let request = task.request();
        let rec = task.snapshot();

        remove_stale_layout(&rec.temp_dir(), request.thread_num).await;

        let first_part = rec.part_path(0);
        let resumed_bytes = file_len(&first_part).await;
        let stored = ctx.store.get_validator(&rec.id).await?;
        let (req, conditional) = build_request(&rec, stored.as_ref(), resumed_bytes, request.force_redownload);

        if task.should_stop() {
            return Ok(task.snapshot());
        }
        let conn = match connect_cancelable(ctx.driver.as_ref(), &req, task.cancel_token()).await {
            Ok(conn) => conn,
            Err(DriverError::Canceled) => return Ok(task.snapshot()),
            Err(e) => {
                if !task.cancel_token().is_cancelled() {
                    warn!(id = %rec.id, url = %rec.url, "connect failed: {e}");
                    task.set_error(ErrorCode::NetworkUnavailable);
                }
                return Ok(task.snapshot());
            }
        };

        let status = conn.status();
        let chunked = conn
            .header("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        let content_length = content_length(conn.as_ref(), chunked);
        {
            let mut r = task.record().lock();
            r.md5 = conn.header("Content-MD5");
            r.chunked = chunked;
        }
        debug!(id = %rec.id, status, content_length, chunked, conditional, "connected");

        match status {
            200..=299 => {
                if content_length == CONTENT_LENGTH_NOT_FOUND && !chunked {
                    task.set_error(ErrorCode::ContentLengthNotFound);
                    return Ok(task.snapshot());
                }
                if !has_usable_space(&rec.file_path, content_length, &ctx.config).await {
                    task.set_error(ErrorCode::UsableSpaceNotEnough);
                    return Ok(task.snapshot());
                }
            }
            304 if rec.finished => {
                info!(id = %rec.id, "not modified, keeping the finished file");
                drop(conn);
                task.mark_finished(rec.content_length.max(0) as u64).await;
                return Ok(task.snapshot());
            }
            404 => {
                task.set_error(ErrorCode::FileNotFound);
                return Ok(task.snapshot());
            }
            416 if conditional => {
                warn!(id = %rec.id, offset = resumed_bytes, "resume offset rejected, discarding parts");
                remove_dir(&rec.temp_dir()).await;
                task.set_error(ErrorCode::UnknownServerError);
                return Ok(task.snapshot());
            }
            _ => {
                warn!(id = %rec.id, status, "unexpected response status");
                task.set_error(ErrorCode::UnknownServerError);
                return Ok(task.snapshot());
            }
        }

        let validator = CacheValidator::from_headers(
            &rec.id,
            conn.header("ETag").as_deref(),
            conn.header("Last-Modified").as_deref(),
        );
        let accept_ranges = conn
            .header("Accept-Ranges")
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let server_resumable = !chunked && validator.is_some() && (conditional || accept_ranges);
        let resumable = server_resumable && !rec.resume_disabled();
        if server_resumable {
            if let Some(v) = &validator {
                if let Err(e) = ctx.store.put_validator(v).await {
                    warn!(id = %rec.id, "persist validator failed: {e:#}");
                }
            }
        }

        let plan = plan_segments(content_length, if resumable { request.thread_num } else { 1 });
        check_download_file(task, content_length, resumable, plan.len()).await;

        let segment_cancel = task.cancel_token().child_token();
        let block_validator = if resumable { validator } else { None };
        let blocks: Vec<Arc<BlockTask>> = plan
            .into_iter()
            .map(|seg| {
                Arc::new(BlockTask::new(
                    task.clone(),
                    seg,
                    content_length,
                    block_validator.clone(),
                    segment_cancel.clone(),
                ))
            })
            .collect();

        if status == 200 {
            if conditional {
                info!(id = %rec.id, "remote file changed, restarting from zero");
                remove_dir(&rec.temp_dir()).await;
            }
            // the body starts at byte 0, so segment 0 starts over
            if let Some(first) = blocks.first() {
                first.clear_temp().await;
            }
        }

        let mut completed = 0;
        for block in &blocks {
            completed += block.completed_size().await;
        }
        task.set_initial_completed(completed);
        touch_parts(&rec, blocks.len()).await;

        // The open response can only feed segment 0 when it starts exactly
        // where part-0 ends.
        let offset = if status == 206 { content_range_start(conn.as_ref()) } else { Some(0) };
        let reuse = offset == Some(file_len(&first_part).await);
        info!(id = %rec.id, segments = blocks.len(), resumable, completed, "transfer starting");

        let Some((first, rest)) = blocks.split_first() else {
            return chain.proceed().await;
        };
        let handles: Vec<_> = rest
            .iter()
            .cloned()
            .map(|block| tokio::spawn(async move { block.run(None).await }))
            .collect();
        first.run(reuse.then_some(conn)).await;

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                warn!(id = %rec.id, "segment task aborted: {e}");
                task.set_error(ErrorCode::DownloadFailed);
            }
        }
        chain.proceed().await
    }
}

fn build_request(
    rec: &DownloadRecord,
    stored: Option<&CacheValidator>,
    resumed_bytes: u64,
    force_redownload: bool,
) -> (DriverRequest, bool) {
    let mut req = DriverRequest::new(&rec.url);
    let Some(v) = stored else {
        return (req, false);
    };

    if resumed_bytes > 0 && !rec.resume_disabled() {
        if let Some(if_range) = v.if_range_value() {
            req = req
                .header("If-Range", if_range)
                .header("Range", format!("bytes={resumed_bytes}-"));
            return (req, true);
        }
    } else if rec.finished && !force_redownload {
        if let Some(lm) = &v.last_modified {
            req = req.header("If-Modified-Since", lm.clone());
        }
        if let Some(etag) = &v.etag {
            req = req.header("If-None-Match", etag.clone());
        }
    }
    (req, false)
}

/// Total length from `Content-Range` when present, else `Content-Length`.
fn content_length(conn: &dyn Connection, chunked: bool) -> i64 {
    let from_range = conn
        .header("Content-Range")
        .and_then(|v| v.rsplit_once('/').and_then(|(_, total)| total.trim().parse::<i64>().ok()));
    if let Some(len) = from_range {
        return len;
    }
    if chunked {
        return CONTENT_LENGTH_NOT_FOUND;
    }
    conn.header("Content-Length")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(CONTENT_LENGTH_NOT_FOUND)
}

fn content_range_start(conn: &dyn Connection) -> Option<u64> {
    let value = conn.header("Content-Range")?;
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

async fn has_usable_space(output: &Path, content_length: i64, cfg: &DownloadConfig) -> bool {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!(dir = %dir.display(), "create download dir failed: {e}");
        return true;
    }

    let needed = content_length.max(0) as u64 * 2;
    match (fs2::available_space(dir), fs2::available_space(&cfg.data_dir)) {
        (Ok(target), Ok(data)) => {
            if target < needed || data <= cfg.min_usable_space {
                warn!(
                    available = %crate::core::speed::fmt_bytes(target),
                    needed = %crate::core::speed::fmt_bytes(needed),
                    "usable space not enough"
                );
                return false;
            }
            true
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("free space query failed: {e}");
            true
        }
    }
}

/// Drops the temp dir when it was laid out for a different segment count.
async fn remove_stale_layout(temp_dir: &Path, thread_num: usize) {
    let Ok(mut entries) = tokio::fs::read_dir(temp_dir).await else {
        return;
    };
    let mut parts = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(PART_PREFIX) {
            parts += 1;
        }
    }
    if parts != thread_num {
        debug!(dir = %temp_dir.display(), parts, thread_num, "segment layout changed");
        remove_dir(temp_dir).await;
    }
}

async fn check_download_file(task: &DownloadTask, content_length: i64, resumable: bool, segments: usize) {
    let (temp_dir, output, length_changed) = {
        let r = task.record().lock();
        (r.temp_dir(), r.file_path.clone(), r.content_length != content_length)
    };
    if !resumable || length_changed {
        remove_dir(&temp_dir).await;
    }
    {
        let mut r = task.record().lock();
        r.content_length = content_length;
        r.finished = false;
        r.thread_num = segments;
    }
    remove_file(&output).await;
    task.update_info().await;
}

/// Creates every part file up front so the on-disk layout always matches
/// the segment count, even if some segments never receive a byte.
async fn touch_parts(rec: &DownloadRecord, count: usize) {
    if let Err(e) = tokio::fs::create_dir_all(rec.temp_dir()).await {
        warn!(dir = %rec.temp_dir().display(), "create temp dir failed: {e}");
        return;
    }
    for i in 0..count {
        let path = rec.part_path(i);
        if let Err(e) = OpenOptions::new().create(true).append(true).open(&path).await {
            warn!(part = %path.display(), "create part failed: {e}");
        }
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "remove failed: {e}");
        }
    }
}

async fn remove_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "remove dir failed: {e}");
        }
    }
}
