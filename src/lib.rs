//! Resumable multi-segment HTTP downloads.

pub mod config;
pub mod core;
pub mod driver;
