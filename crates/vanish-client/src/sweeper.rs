//! Background retention sweep.
//!
//! Deletes expired vault records on a fixed interval. While the vault is
//! locked each tick is deferred; the first unlocked tick catches up, since
//! every record carries its own deadline.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
};
use vanish_core::env::Environment;
use vanish_vault::{Storage, SweepReport, UnlockHandle, Vault};

use crate::error::ClientError;

/// Time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sweeper configuration.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_SWEEP_INTERVAL }
    }
}

/// The application's unlock handle, shared with the sweeper.
///
/// Locking the vault means calling [`UnlockHandle::lock`] through the write
/// guard; the sweeper sees it on its next tick.
pub type SharedHandle = Arc<RwLock<UnlockHandle>>;

/// Periodic sweep over one vault.
pub struct Sweeper<S: Storage, E: Environment> {
    vault: Arc<Vault<S, E>>,
    handle: SharedHandle,
    env: E,
    config: SweeperConfig,
}

impl<S: Storage, E: Environment> Sweeper<S, E> {
    /// Create a sweeper. Nothing runs until [`Sweeper::spawn`].
    pub fn new(vault: Arc<Vault<S, E>>, handle: SharedHandle, env: E, config: SweeperConfig) -> Self {
        Self { vault, handle, env, config }
    }

    /// Run one sweep now.
    ///
    /// The sweep does storage I/O, so it runs on the blocking pool. The
    /// handle stays read-locked for its duration: locking the vault waits
    /// for an in-flight sweep to finish.
    pub async fn sweep_once(&self) -> Result<SweepReport, ClientError> {
        let vault = Arc::clone(&self.vault);
        let handle = Arc::clone(&self.handle);
        let now = self.env.wall_clock_secs() as f64;

        let report = tokio::task::spawn_blocking(move || {
            let handle = handle.blocking_read();
            vault.sweep(&handle, now)
        })
        .await
        .map_err(|e| ClientError::SweepTask(e.to_string()))?;

        Ok(report?)
    }

    /// Start sweeping every interval until shut down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SweeperHandle { shutdown: shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(interval = ?self.config.interval, "Sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                () = self.env.sleep(self.config.interval) => {},
            }

            match self.sweep_once().await {
                Ok(SweepReport::Swept { deleted, remaining }) => {
                    if deleted > 0 {
                        tracing::info!(deleted, remaining, "Retention sweep");
                    }
                },
                Ok(SweepReport::Deferred) => {
                    tracing::debug!("Retention sweep deferred until unlock");
                },
                Err(e) => tracing::warn!(error = %e, "Retention sweep failed"),
            }
        }

        tracing::debug!("Sweeper stopped");
    }
}

/// Running sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sweeper task failed");
        }
    }
}
