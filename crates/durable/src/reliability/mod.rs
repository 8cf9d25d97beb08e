//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`retry_transient`] - Retry loop for transient storage errors

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{retry_transient, RetryPolicy};
