use crate::core::interceptors::{ConnectInterceptor, MergeInterceptor, RetryInterceptor};
use crate::core::model::DownloadRecord;
use crate::core::task::DownloadTask;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// One stage of a download. A stage either calls `chain.proceed()` to run
/// the stages after it, or returns early to short-circuit them.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn intercept(&self, chain: &DownloadChain<'_>) -> anyhow::Result<DownloadRecord>;
}

/// Cursor into an ordered interceptor list.
pub struct DownloadChain<'a> {
    interceptors: &'a [Box<dyn Interceptor>],
    index: usize,
    task: &'a Arc<DownloadTask>,
}

impl<'a> DownloadChain<'a> {
    pub fn new(interceptors: &'a [Box<dyn Interceptor>], task: &'a Arc<DownloadTask>) -> Self {
        Self { interceptors, index: 0, task }
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        self.task
    }

    /// Runs the next stage. Past the last stage this yields the record as it
    /// stands.
    pub async fn proceed(&self) -> anyhow::Result<DownloadRecord> {
        match self.interceptors.get(self.index) {
            None => Ok(self.task.snapshot()),
            Some(stage) => {
                trace!(id = %self.task.id(), stage = stage.name(), "enter stage");
                let next = DownloadChain {
                    interceptors: self.interceptors,
                    index: self.index + 1,
                    task: self.task,
                };
                stage.intercept(&next).await
            }
        }
    }
}

/// Retry wraps Connect, Connect wraps Merge.
pub fn default_interceptors() -> Vec<Box<dyn Interceptor>> {
    vec![
        Box::new(RetryInterceptor),
        Box::new(ConnectInterceptor),
        Box::new(MergeInterceptor),
    ]
}
