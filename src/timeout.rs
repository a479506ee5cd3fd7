//! Deadline harness for peer-connection operations
//!
//! All peer-connection calls may block indefinitely, so every signalling
//! operation runs under one of two deadlines: `CONNECT` for negotiation-class
//! work (offer/answer/gather, subscribe fan-out) and `READ` for incremental
//! work (remote answer, candidates, close). On expiry the losing future is
//! dropped and the caller gets `Error::ServerTimeout`.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Deadline for negotiation-class operations
pub const CONNECT: Duration = Duration::from_secs(20);

/// Deadline for incremental operations and the forwarding-queue watchdog
pub const READ: Duration = Duration::from_secs(5);

/// Run `fut` to completion or until `duration` elapses, whichever is first.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::ServerTimeout(duration)),
    }
}
