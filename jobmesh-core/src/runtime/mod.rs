//! Runtime helpers shared by the coordination services
//!
//! Shutdown signalling and bounded, cancellable polling.

pub mod backoff;
pub mod shutdown;

pub use backoff::{poll_until, PollOutcome, RetryPolicy};
pub use shutdown::ShutdownSignal;
