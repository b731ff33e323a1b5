//! Periodic sweep for stale sagas.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SagaData;
use crate::interfaces::SagaRepository;

/// Sentinel state assigned to sagas that exceeded their activity
/// timeout.
pub const TIMED_OUT_STATE: &str = "TimedOut";

/// Timeout monitor configuration.
#[derive(Debug, Clone)]
pub struct TimeoutMonitorOptions {
    /// How often the sweep runs.
    pub check_interval: Duration,
    /// Inactivity threshold after which a saga is considered stale.
    pub default_timeout: Duration,
}

impl Default for TimeoutMonitorOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(600),
        }
    }
}

/// Type-erased handle for background saga tasks, so the facade can
/// start and drain monitors for heterogeneous saga data types.
#[async_trait]
pub trait SagaBackgroundTask: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
}

/// Background task sweeping for sagas whose `updated_at` exceeded the
/// timeout. Stale sagas move to the [`TIMED_OUT_STATE`] sentinel and
/// complete; concurrency conflicts are swallowed (the saga was updated
/// elsewhere) and unexpected errors are logged without stopping the
/// loop.
pub struct TimeoutMonitor<D: SagaData> {
    saga_name: String,
    repository: Arc<dyn SagaRepository<D>>,
    options: TimeoutMonitorOptions,
    cancel: CancellationToken,
    sweep_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<D: SagaData> TimeoutMonitor<D> {
    pub fn new(
        saga_name: impl Into<String>,
        repository: Arc<dyn SagaRepository<D>>,
        options: TimeoutMonitorOptions,
    ) -> Self {
        Self {
            saga_name: saga_name.into(),
            repository,
            options,
            cancel: CancellationToken::new(),
            sweep_loop: tokio::sync::Mutex::new(None),
        }
    }

    /// One sweep over the repository's stale sagas.
    pub async fn sweep(&self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.options.default_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let stale = match self.repository.find_stale(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(saga = %self.saga_name, error = %e, "Stale-saga query failed");
                return;
            }
        };

        for mut saga in stale {
            if saga.is_completed() {
                continue;
            }
            debug!(
                saga = %self.saga_name,
                correlation_id = %saga.correlation_id(),
                state = %saga.state(),
                "Timing out stale saga"
            );
            saga.set_state(TIMED_OUT_STATE);
            saga.complete();
            match self.repository.update(&saga).await {
                Ok(()) => {
                    warn!(
                        saga = %self.saga_name,
                        correlation_id = %saga.correlation_id(),
                        "Saga timed out"
                    );
                }
                Err(e) if e.is_concurrency() => {
                    // The saga progressed concurrently; not stale after all.
                    debug!(
                        saga = %self.saga_name,
                        correlation_id = %saga.correlation_id(),
                        "Timeout raced with a live update; skipped"
                    );
                }
                Err(e) => {
                    error!(
                        saga = %self.saga_name,
                        correlation_id = %saga.correlation_id(),
                        error = %e,
                        "Failed to persist timed-out saga"
                    );
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        // interval() panics on a zero period.
        let period = self.options.check_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh start
        // does not sweep before anything can be stale.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(saga = %self.saga_name, "Timeout monitor stopped");
                    return;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }
}

#[async_trait]
impl<D: SagaData> SagaBackgroundTask for Arc<TimeoutMonitor<D>> {
    async fn start(&self) {
        let mut slot = self.sweep_loop.lock().await;
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(Arc::clone(self).run()));
        info!(
            saga = %self.saga_name,
            interval_secs = self.options.check_interval.as_secs(),
            timeout_secs = self.options.default_timeout.as_secs(),
            "Timeout monitor started"
        );
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.sweep_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(saga = %self.saga_name, error = %e, "Timeout monitor join failed");
            }
        }
    }
}
