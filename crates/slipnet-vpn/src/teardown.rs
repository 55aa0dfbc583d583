//! Process-exit teardown.
//!
//! Every way out of the process (signal, fatal error, normal exit) goes
//! through [`Teardown::shutdown`]. It runs at most once and is bounded by
//! the configured teardown timeout.

use crate::service::ServiceManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Termination signal that ended the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP
    Hangup,
}

impl ExitSignal {
    /// Conventional shell exit status (128 + signal number)
    pub fn exit_code(self) -> i32 {
        match self {
            ExitSignal::Interrupt => 130,
            ExitSignal::Terminate => 143,
            ExitSignal::Hangup => 129,
        }
    }
}

impl std::fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitSignal::Interrupt => write!(f, "SIGINT"),
            ExitSignal::Terminate => write!(f, "SIGTERM"),
            ExitSignal::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Wait for the first termination signal
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<ExitSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| ExitSignal::Interrupt),
        _ = terminate.recv() => Ok(ExitSignal::Terminate),
        _ = hangup.recv() => Ok(ExitSignal::Hangup),
    }
}

/// Wait for the first termination signal
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<ExitSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ExitSignal::Interrupt)
}

/// Once-only, time-bounded shutdown of the service
#[derive(Clone)]
pub struct Teardown {
    service: ServiceManager,
    limit: Duration,
    done: Arc<AtomicBool>,
}

impl Teardown {
    /// Teardown bounded by the service's configured timeout
    pub fn new(service: ServiceManager) -> Self {
        let limit = service.config().teardown_timeout;
        Self::with_timeout(service, limit)
    }

    pub fn with_timeout(service: ServiceManager, limit: Duration) -> Self {
        Self {
            service,
            limit,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Has a shutdown been started?
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Wait for a spawned task. If it panicked (or was cancelled) the
    /// shutdown runs before `None` is returned.
    pub async fn supervise<T>(&self, task: &mut JoinHandle<T>) -> Option<T> {
        match task.await {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Task ended abnormally: {}", e);
                self.shutdown(if e.is_panic() { "panic" } else { "task cancelled" })
                    .await;
                None
            }
        }
    }

    /// Disable the system proxy (if ours), close the relay and stop the
    /// tunnel client.
    ///
    /// Returns `false` when an earlier call already ran the teardown.
    pub async fn shutdown(&self, reason: &str) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            debug!("Teardown already ran, ignoring {}", reason);
            return false;
        }

        info!("Shutting down: {}", reason);
        match tokio::time::timeout(self.limit, self.service.shutdown()).await {
            Ok(()) => info!("Teardown complete"),
            Err(_) => warn!("Teardown did not finish within {:?}, exiting anyway", self.limit),
        }
        true
    }
}
