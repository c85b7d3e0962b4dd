use crate::core::chain::{DownloadChain, Interceptor};
use crate::core::model::{DownloadRecord, ErrorCode};
use async_trait::async_trait;
use tracing::info;

/// Re-runs the inner stages after a network failure, up to the request's
/// retry count, sleeping the retry delay in between.
pub struct RetryInterceptor;

#[async_trait]
impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn intercept(&self, chain: &DownloadChain<'_>) -> anyhow::Result<DownloadRecord> {
        let task = chain.task();
        let request = task.request();
        let mut tries = 0u32;

        loop {
            let record = chain.proceed().await?;
            let retryable = record.error_code == Some(ErrorCode::NetworkUnavailable)
                && tries < request.retry_count
                && !task.cancel_token().is_cancelled();
            if !retryable {
                return Ok(record);
            }

            tries += 1;
            info!(id = %task.id(), attempt = tries, max = request.retry_count, "retrying after network failure");
            task.prepare_retry();
            tokio::select! {
                biased;
                _ = task.cancel_token().cancelled() => return Ok(task.snapshot()),
                _ = tokio::time::sleep(request.retry_delay) => {}
            }
        }
    }
}
