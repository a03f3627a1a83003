//! Sync/async execution bridge
//!
//! The pipeline's control flow is synchronous; hooks and agents are async.
//! Before blocking on a future the bridge checks whether the calling thread
//! is already inside a tokio runtime:
//!
//! - no runtime: build a current-thread runtime and drive the future on it
//! - inside a runtime: blocking that runtime's thread would deadlock it
//!   (and `block_in_place` panics on a current-thread runtime), so the
//!   future moves to a dedicated thread that owns its own runtime while the
//!   caller waits on a channel, bounded by the caller's deadline
//!
//! Either way the future races the cancellation token, and a bounded call
//! that misses its deadline cancels the worker before returning. The runtime
//! is shut down in the background afterwards, so `spawn_blocking` work that
//! outlived the deadline never delays the caller.

use std::future::Future;
use std::sync::mpsc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_core::{Result, VigilError};

/// Extra wait past a bounded call's deadline before the caller gives up.
///
/// Bounded futures enforce their own deadline and need a moment to hand
/// back partial results.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How a future gets driven from synchronous code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStrategy {
    /// No runtime on this thread: drive the future here
    Direct,
    /// A runtime is running on this thread: hand off to a worker thread
    DedicatedThread,
}

impl BridgeStrategy {
    /// Strategy for the calling thread
    pub fn detect() -> Self {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => Self::DedicatedThread,
            Err(_) => Self::Direct,
        }
    }
}

/// Runs futures to completion from synchronous code
#[derive(Debug, Clone)]
pub struct AsyncBridge {
    grace: Duration,
}

impl Default for AsyncBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncBridge {
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Drive `fut` to completion unless `cancel` fires first
    pub fn run<F, T>(&self, fut: F, cancel: &CancellationToken) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.drive(fut, None, cancel)
    }

    /// Like [`run`](Self::run), failing with `AgentTimeout` once `bound` passes
    pub fn run_bounded<F, T>(&self, fut: F, bound: Duration, cancel: &CancellationToken) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.drive(fut, Some(bound), cancel)
    }

    fn drive<F, T>(&self, fut: F, bound: Option<Duration>, cancel: &CancellationToken) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match BridgeStrategy::detect() {
            BridgeStrategy::Direct => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                let outcome = runtime.block_on(race(fut, bound, cancel.clone()));
                // Blocking work left behind by a missed deadline must not hold the caller
                runtime.shutdown_background();
                outcome
            }
            BridgeStrategy::DedicatedThread => self.on_worker(fut, bound, cancel),
        }
    }

    fn on_worker<F, T>(&self, fut: F, bound: Option<Duration>, cancel: &CancellationToken) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        debug!("Runtime already active; driving future on a worker thread");
        let worker_cancel = cancel.child_token();
        let token = worker_cancel.clone();
        let (tx, rx) = mpsc::channel::<Result<T>>();

        std::thread::Builder::new()
            .name("vigil-bridge".to_string())
            .spawn(move || {
                let outcome = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(VigilError::from)
                    .and_then(|runtime| {
                        let outcome = runtime.block_on(race(fut, bound, token));
                        runtime.shutdown_background();
                        outcome
                    });
                // Receiver is gone when the caller already gave up
                let _ = tx.send(outcome);
            })?;

        let received = match bound {
            Some(bound) => rx.recv_timeout(bound + self.grace),
            None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("Worker missed its deadline; cancelling it");
                worker_cancel.cancel();
                Err(VigilError::AgentTimeout {
                    timeout_secs: bound.map(|b| b.as_secs()).unwrap_or_default(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(VigilError::Other(
                "bridge worker exited without a result".to_string(),
            )),
        }
    }
}

async fn race<F, T>(fut: F, bound: Option<Duration>, cancel: CancellationToken) -> Result<T>
where
    F: Future<Output = T>,
{
    let deadline = async {
        match bound {
            Some(bound) => tokio::time::sleep(bound).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        out = fut => Ok(out),
        _ = cancel.cancelled() => Err(VigilError::Cancelled),
        _ = deadline => Err(VigilError::AgentTimeout {
            timeout_secs: bound.map(|b| b.as_secs()).unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_direct_without_runtime() {
        assert_eq!(BridgeStrategy::detect(), BridgeStrategy::Direct);
        let out = AsyncBridge::new()
            .run(async { 40 + 2 }, &CancellationToken::new())
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_dedicated_thread_inside_runtime() {
        assert_eq!(BridgeStrategy::detect(), BridgeStrategy::DedicatedThread);
        let out = AsyncBridge::new()
            .run(
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    "done"
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(out, "done");
    }

    #[tokio::test]
    async fn test_bound_enforced_inside_runtime() {
        let start = Instant::now();
        let err = AsyncBridge::new()
            .with_grace(Duration::from_millis(50))
            .run_bounded(
                async { tokio::time::sleep(Duration::from_secs(30)).await },
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, VigilError::AgentTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancelled_before_completion() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = AsyncBridge::new()
            .run(async { tokio::time::sleep(Duration::from_secs(30)).await }, &cancel)
            .unwrap_err();
        assert!(matches!(err, VigilError::Cancelled));
    }
}
