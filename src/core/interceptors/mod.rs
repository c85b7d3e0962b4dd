mod connect;
mod merge;
mod retry;

pub use connect::ConnectInterceptor;
pub use merge::MergeInterceptor;
pub use retry::RetryInterceptor;
