//! Supervises the worker's long-running processes.
//!
//! All registered processes run concurrently until one fails or a shutdown
//! signal (SIGINT/SIGTERM) arrives; then every process is cancelled through
//! a shared [`CancellationToken`] and the registered closers run under a
//! timeout before the process exits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A long-running process: takes the shutdown token, runs until cancelled
/// or failed.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>
        + Send,
>;

/// A cleanup function executed after every process has stopped.
pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>> + Send>;

pub struct Runner {
    app_processes: Vec<AppProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Add one app process. If any process returns an error, all processes
    /// are cancelled and the closers run.
    pub fn with_app_process<F, Fut>(mut self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.app_processes
            .push(Box::new(|token| Box::pin(process(token))));
        self
    }

    /// Add a batch of already-boxed processes, as produced by a worker
    /// module's `into_runner_processes`.
    pub fn with_app_processes(mut self, processes: Vec<AppProcess>) -> Self {
        self.app_processes.extend(processes);
        self
    }

    /// Add a closer. Closers run after all processes have stopped, whatever
    /// the reason; each one attempts to run even if another fails.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned cancellation token instead of a fresh one.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run every process until completion or shutdown, then run closers and
    /// exit the process with 0 (clean stop) or 1 (a process failed).
    pub async fn run(self) {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for process in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move { process(process_token).await });
        }

        spawn_signal_listeners(token.clone());

        let failed = wait_for_processes(&mut join_set, &token).await;
        join_set.shutdown().await;

        if !self.closers.is_empty() {
            tracing::info!(timeout = ?self.closer_timeout, "Running closers");
            let result =
                tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await;
            match result {
                Ok(()) => tracing::info!("All closers completed"),
                Err(_) => tracing::error!(timeout = ?self.closer_timeout, "Closers timed out"),
            }
        }

        if failed {
            tracing::error!("Application exiting after process failure");
            std::process::exit(1);
        }
        tracing::info!("Application exiting normally");
        std::process::exit(0);
    }
}

/// Cancel the token on SIGINT, and on SIGTERM where the platform has one.
fn spawn_signal_listeners(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => tracing::error!(error = %err, "Failed to install SIGINT handler"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
                token.cancel();
            }
            Err(err) => tracing::error!(error = %err, "Failed to install SIGTERM handler"),
        }
    });
}

/// Drain the join set until every process finished or one failed/panicked;
/// a failure cancels the rest. Returns whether any process failed.
async fn wait_for_processes(
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    token: &CancellationToken,
) -> bool {
    let mut failed = false;
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => tracing::debug!("App process completed"),
            Ok(Err(err)) => {
                tracing::error!(error = %format!("{err:#}"), "App process error");
                failed = true;
            }
            Err(err) => {
                tracing::error!(error = %err, "App process panicked");
                failed = true;
            }
        }
        if failed && !token.is_cancelled() {
            token.cancel();
        }
        if token.is_cancelled() {
            break;
        }
    }
    failed
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }
    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => tracing::debug!("Closer completed"),
            Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "Closer error"),
            Err(err) => tracing::error!(error = %err, "Closer panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closers_all_run_despite_failures() {
        let ran = Arc::new(AtomicUsize::new(0));

        let ok_flag = ran.clone();
        let err_flag = ran.clone();
        let runner = Runner::new()
            .with_closer(move || {
                let flag = ok_flag.clone();
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .with_closer(move || {
                let flag = err_flag.clone();
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("cleanup failed"))
                }
            });

        run_closers(runner.closers).await;

        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_process_cancels_the_rest() {
        let token = CancellationToken::new();
        let mut join_set = JoinSet::new();

        let loop_token = token.clone();
        join_set.spawn(async move {
            loop_token.cancelled().await;
            Ok(())
        });
        join_set.spawn(async move { Err(anyhow::anyhow!("boom")) });

        let failed = wait_for_processes(&mut join_set, &token).await;

        assert!(failed);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_clean_shutdown_reports_no_failure() {
        let token = CancellationToken::new();
        let mut join_set = JoinSet::new();

        let loop_token = token.clone();
        join_set.spawn(async move {
            loop_token.cancelled().await;
            Ok(())
        });
        token.cancel();

        let failed = wait_for_processes(&mut join_set, &token).await;

        assert!(!failed);
    }
}
