//! Stats polling loop and per-run daemon registry

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{jittered_wait, Backoff, StatsConfig, StatsFetcher, StatsTarget};
use crate::client::RunKubeClient;
use crate::error::{RunError, TelemetryFetchError};

/// Sleep unless cancelled first; returns false on cancellation
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[derive(Debug, thiserror::Error)]
enum CycleError {
    #[error("{0}")]
    Fetch(TelemetryFetchError),
    #[error("status update failed: {0}")]
    Status(RunError),
}

async fn poll_once(
    target: &StatsTarget,
    fetcher: &dyn StatsFetcher,
    kube: &dyn RunKubeClient,
) -> Result<(), CycleError> {
    let snapshot = fetcher.fetch(target).await.map_err(CycleError::Fetch)?;
    let status = snapshot.to_status(target.expected_workers, Utc::now());
    let status = serde_json::to_value(&status)
        .map_err(|e| CycleError::Status(RunError::Serialization(e)))?;
    kube.patch_status(&target.namespace, &target.run, &status)
        .await
        .map_err(CycleError::Status)?;
    debug!(
        run = %target.run,
        state = %snapshot.state,
        users = snapshot.user_count,
        workers = snapshot.worker_count,
        "updated telemetry"
    );
    Ok(())
}

/// Poll one run's stats until `cancel` fires
///
/// The target is re-read at the start of every cycle so worker count or port
/// changes apply without restarting the loop. Cancellation is checked before
/// each fetch and interrupts every wait.
pub async fn run_stats_loop(
    target: watch::Receiver<StatsTarget>,
    fetcher: Arc<dyn StatsFetcher>,
    kube: Arc<dyn RunKubeClient>,
    config: StatsConfig,
    cancel: CancellationToken,
) {
    if !sleep_or_cancel(config.initial_delay, &cancel).await {
        return;
    }

    let mut backoff = Backoff::new(config.backoff_floor);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let current = target.borrow().clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = poll_once(&current, fetcher.as_ref(), kube.as_ref()) => result,
        };

        let wait = match result {
            Ok(()) => {
                backoff.reset();
                let offset = rand::thread_rng().gen_range(-1.0..=1.0);
                jittered_wait(config.interval, started.elapsed(), config.jitter, offset)
            }
            Err(e) => {
                let delay = backoff.next_delay(config.interval);
                warn!(
                    run = %current.run,
                    namespace = %current.namespace,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "stats cycle failed"
                );
                delay
            }
        };

        if !sleep_or_cancel(wait, &cancel).await {
            break;
        }
    }

    debug!(run = %target.borrow().run, "stats loop stopped");
}

struct DaemonHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    target: watch::Sender<StatsTarget>,
}

/// Registry of running stats daemons, one per LocustTest
pub struct StatsDaemons {
    kube: Arc<dyn RunKubeClient>,
    fetcher: Arc<dyn StatsFetcher>,
    config: StatsConfig,
    root: CancellationToken,
    daemons: DashMap<String, DaemonHandle>,
}

impl StatsDaemons {
    pub fn new(
        kube: Arc<dyn RunKubeClient>,
        fetcher: Arc<dyn StatsFetcher>,
        config: StatsConfig,
    ) -> Self {
        Self {
            kube,
            fetcher,
            config,
            root: CancellationToken::new(),
            daemons: DashMap::new(),
        }
    }

    /// Start the daemon for `target` or hand a running one the new target
    pub fn ensure(&self, target: StatsTarget) {
        if self.root.is_cancelled() {
            return;
        }

        match self.daemons.entry(target.key()) {
            Entry::Occupied(entry) if !entry.get().task.is_finished() => {
                entry.get().target.send_if_modified(|current| {
                    if *current == target {
                        false
                    } else {
                        *current = target;
                        true
                    }
                });
            }
            Entry::Occupied(mut entry) => {
                entry.insert(self.spawn(target));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn(target));
            }
        }
    }

    fn spawn(&self, target: StatsTarget) -> DaemonHandle {
        info!(run = %target.run, namespace = %target.namespace, "starting stats daemon");
        let cancel = self.root.child_token();
        let (tx, rx) = watch::channel(target);
        let task = tokio::spawn(run_stats_loop(
            rx,
            self.fetcher.clone(),
            self.kube.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        DaemonHandle {
            cancel,
            task,
            target: tx,
        }
    }

    /// Stop one daemon and wait for it to exit
    pub async fn stop(&self, key: &str) {
        if let Some((_, handle)) = self.daemons.remove(key) {
            info!(run = %key, "stopping stats daemon");
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(run = %key, error = %e, "stats daemon task failed");
            }
        }
    }

    /// Stop every daemon; later `ensure` calls are ignored
    pub async fn shutdown(&self) {
        self.root.cancel();
        let keys: Vec<String> = self.daemons.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    /// Number of registered daemons
    pub fn len(&self) -> usize {
        self.daemons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }

    /// Current target of a daemon, if registered
    pub fn target(&self, key: &str) -> Option<StatsTarget> {
        self.daemons
            .get(key)
            .map(|handle| handle.target.borrow().clone())
    }
}
