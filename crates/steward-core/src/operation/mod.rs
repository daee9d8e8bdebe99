// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent lifecycle operations and the retryable blocks grouping them.
//!
//! Every [`Operation`] has a side-effect free [`Operation::check`] telling
//! whether it still needs to run, and an [`Operation::run`] performing it.
//! A failing `run` leaves the application in a Failed (or Degraded) state
//! with the cause as its message before returning the error.

mod artifact;
mod lifecycle;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::application::Application;
use crate::error::Result;
use crate::retry::{RetryConfig, retry};

pub use artifact::{FetchOperation, InstallOperation, RemoveOperation, UninstallOperation, VerifyOperation};
pub use lifecycle::{ConfigureOperation, StartOperation, StopOperation};

/// One idempotent lifecycle step.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the operation still needs to run. Must not have side effects.
    async fn check(&self, ctx: &CancellationToken, app: &Arc<Application>) -> Result<bool>;

    async fn run(&self, ctx: &CancellationToken, app: &Arc<Application>) -> Result<()>;
}

/// Ordered operations retried as one unit.
///
/// Each attempt re-checks every member and skips the ones already
/// satisfied, so a failed install does not download the artifact again.
pub struct RetryableOperations {
    name: String,
    operations: Vec<Box<dyn Operation>>,
    retry: RetryConfig,
}

impl RetryableOperations {
    pub fn new(retry: RetryConfig, operations: Vec<Box<dyn Operation>>) -> Self {
        let names: Vec<&str> = operations.iter().map(|op| op.name()).collect();
        Self {
            name: format!("retryable({})", names.join(", ")),
            operations,
            retry,
        }
    }
}

#[async_trait]
impl Operation for RetryableOperations {
    fn name(&self) -> &str {
        &self.name
    }

    /// True as soon as one member needs to run.
    async fn check(&self, ctx: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        for op in &self.operations {
            if op.check(ctx, app).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[instrument(skip_all, fields(app_id = %app.id(), block = %self.name))]
    async fn run(&self, ctx: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        let operations = &self.operations;
        retry(ctx, &self.retry, |attempt| async move {
            debug!(attempt, "running block");
            run_operations(ctx, app, operations).await
        })
        .await
    }
}

/// Run every operation whose check asks for it, in order, stopping at the
/// first failure.
pub async fn run_operations(
    ctx: &CancellationToken,
    app: &Arc<Application>,
    operations: &[Box<dyn Operation>],
) -> Result<()> {
    for op in operations {
        if ctx.is_cancelled() {
            return Err(crate::error::Error::Cancelled);
        }
        if !op.check(ctx, app).await? {
            debug!(app_id = %app.id(), operation = op.name(), "skipping, already satisfied");
            continue;
        }
        debug!(app_id = %app.id(), operation = op.name(), "running");
        op.run(ctx, app).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::application::{ApplicationStatusHandler, ProcessConfig};
    use crate::artifact::Layout;
    use crate::descriptor::{Descriptor, ProgramSpec};
    use crate::error::Error;
    use crate::monitor::NoopMonitor;
    use crate::reporter::NoopReporter;
    use crate::server::{Server, ServerConfig};

    /// Needs to run while `satisfied_after` is not reached; fails `failures`
    /// times before succeeding.
    struct Counting {
        name: &'static str,
        checks: AtomicU32,
        runs: AtomicU32,
        failures: u32,
        satisfied_after: Option<u32>,
        fatal: bool,
    }

    impl Counting {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                checks: AtomicU32::new(0),
                runs: AtomicU32::new(0),
                failures: 0,
                satisfied_after: None,
                fatal: false,
            }
        }
    }

    #[async_trait]
    impl Operation for Arc<Counting> {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self, _: &CancellationToken, _: &Arc<Application>) -> Result<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let runs = self.runs.load(Ordering::SeqCst);
            Ok(self.satisfied_after.is_none_or(|n| runs < n))
        }

        async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                let err = Error::application(app.id(), format!("{} failed", self.name));
                return Err(if self.fatal { err.fatal() } else { err });
            }
            Ok(())
        }
    }

    fn fast_retry(retries_count: u32) -> RetryConfig {
        RetryConfig {
            enabled: true,
            retries_count,
            delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential: false,
        }
    }

    fn app() -> Arc<Application> {
        let tmp = std::env::temp_dir();
        let layout = Layout::host(tmp.join("downloads"), tmp.join("install"));
        let descriptor = Descriptor::new(
            ProgramSpec::new("filebeat", "filebeat"),
            "8.0.0",
            Vec::<String>::new(),
            &layout,
        );
        let srv = Server::new(ServerConfig::default(), Arc::new(ApplicationStatusHandler)).unwrap();
        Application::new(
            descriptor,
            "default",
            srv,
            Arc::new(NoopMonitor),
            Arc::new(NoopReporter),
            ProcessConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_always_failing_block_runs_retries_plus_one() {
        let op = Arc::new(Counting {
            failures: u32::MAX,
            ..Counting::new("fetch")
        });
        let block = RetryableOperations::new(fast_retry(3), vec![Box::new(op.clone())]);

        let err = block.run(&CancellationToken::new(), &app()).await.unwrap_err();
        assert_eq!(op.runs.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("fetch failed"));
    }

    #[tokio::test]
    async fn test_satisfied_operation_is_skipped_on_retry() {
        // fetch succeeds once, install fails once
        let fetch = Arc::new(Counting {
            satisfied_after: Some(1),
            ..Counting::new("fetch")
        });
        let install = Arc::new(Counting {
            failures: 1,
            ..Counting::new("install")
        });
        let block = RetryableOperations::new(
            fast_retry(3),
            vec![Box::new(fetch.clone()), Box::new(install.clone())],
        );

        block.run(&CancellationToken::new(), &app()).await.unwrap();
        assert_eq!(fetch.runs.load(Ordering::SeqCst), 1);
        assert_eq!(install.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_retrying() {
        let op = Arc::new(Counting {
            failures: u32::MAX,
            fatal: true,
            ..Counting::new("verify")
        });
        let block = RetryableOperations::new(fast_retry(5), vec![Box::new(op.clone())]);

        let err = block.run(&CancellationToken::new(), &app()).await.unwrap_err();
        assert_eq!(op.runs.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn test_block_check_short_circuits() {
        let first = Arc::new(Counting::new("fetch"));
        let second = Arc::new(Counting::new("verify"));
        let block = RetryableOperations::new(
            fast_retry(0),
            vec![Box::new(first.clone()), Box::new(second.clone())],
        );
        assert_eq!(block.name(), "retryable(fetch, verify)");

        assert!(block.check(&CancellationToken::new(), &app()).await.unwrap());
        assert_eq!(first.checks.load(Ordering::SeqCst), 1);
        assert_eq!(second.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_block_check_false_when_all_satisfied() {
        let op = Arc::new(Counting {
            satisfied_after: Some(0),
            ..Counting::new("install")
        });
        let block = RetryableOperations::new(fast_retry(0), vec![Box::new(op)]);
        assert!(!block.check(&CancellationToken::new(), &app()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_block_does_not_run() {
        let op = Arc::new(Counting::new("fetch"));
        let block = RetryableOperations::new(fast_retry(3), vec![Box::new(op.clone())]);
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = block.run(&ctx, &app()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(op.runs.load(Ordering::SeqCst), 0);
    }
}
