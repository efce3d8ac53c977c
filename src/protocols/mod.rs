//! Protocol handlers.
//!
//! Each protocol plugs into the server through the [`Handler`] trait.
//!
//! - `resp`: Redis RESP protocol. Parses each message and echoes it back
//! - `echo`: Line echo service, for I/O and shutdown testing
//!
//! [`Handler`]: crate::server::Handler

pub mod echo;
pub mod resp;

use std::future::Future;
use std::time::Duration;

/// Await `fut`, giving up after `idle` if set.
///
/// Returns `None` when the idle timeout elapsed first.
pub(crate) async fn with_idle_timeout<F: Future>(
    idle: Option<Duration>,
    fut: F,
) -> Option<F::Output> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, fut).await.ok(),
        None => Some(fut.await),
    }
}
