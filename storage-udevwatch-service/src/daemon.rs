// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use storage_udevwatch::{
    CoalescingGate, DeviceMatcher, DeviceRegistry, EventSource, InventoryLoader, LoadOptions,
    RelevanceFilter, ResyncTrigger, StateUpdater, UdevWatch, WatchError, WorkQueue,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::Result;

/// Startup populates the inventory; it is not reported as a change.
const INITIAL_LOAD: LoadOptions = LoadOptions {
    refresh: true,
    emit_signal: false,
    cache_refresh: true,
    log: true,
};

enum Exit {
    Signal,
    UpdatesFailed,
}

/// Running watcher: inventory updater, work queue and udev monitor.
pub struct Daemon {
    use_udev: bool,
    watch: UdevWatch,
    updater: StateUpdater,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Load the inventory once, then start udev monitoring.
    pub async fn start(
        config: &ServiceConfig,
        source: Arc<dyn EventSource>,
        registry: Arc<dyn DeviceRegistry>,
        loader: Arc<dyn InventoryLoader>,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let (updater, updater_task) =
            StateUpdater::spawn(loader, config.retry_delay(), shutdown.clone());
        let (queue, worker_task) = WorkQueue::spawn(shutdown.clone());

        match updater.load(INITIAL_LOAD).await {
            Ok(changes) => tracing::debug!("Initial inventory load: {changes} change(s)"),
            Err(e) => {
                shutdown.cancel();
                return Err(e.into());
            }
        }

        let filter = RelevanceFilter::with_signature(
            DeviceMatcher::new(registry),
            config.managed_signature.clone(),
        );
        let trigger = ResyncTrigger::new(
            filter,
            Arc::new(CoalescingGate::new()),
            Arc::new(queue),
            Arc::new(updater.clone()),
        );
        let watch = UdevWatch::new(source, Arc::new(trigger)).with_subsystem(&config.subsystem);

        if let Err(e) = watch.start() {
            shutdown.cancel();
            return Err(e.into());
        }

        Ok(Self {
            use_udev: config.use_udev,
            watch,
            updater,
            shutdown,
            tasks: vec![updater_task, worker_task],
        })
    }

    pub fn is_monitoring(&self) -> bool {
        self.watch.is_running()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Change notification from LVM tooling itself.
    ///
    /// Those are authoritative, so udev monitoring is dropped unless
    /// `use_udev` asks to keep it.
    pub fn external_event(&self) {
        if !self.use_udev && self.watch.stop() {
            tracing::info!("External event received, disabling udev monitoring");
        }
        self.updater.event();
    }

    /// Serve signals until SIGINT/SIGTERM or until inventory updates give up.
    pub async fn run(self) -> Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut external = signal(SignalKind::user_defined1())?;

        let exit = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Exit::UpdatesFailed,
                _ = tokio::signal::ctrl_c() => break Exit::Signal,
                _ = terminate.recv() => break Exit::Signal,
                _ = external.recv() => self.external_event(),
            }
        };

        match exit {
            Exit::Signal => {
                tracing::info!("Received shutdown signal");
                self.stop().await;
                Ok(())
            }
            Exit::UpdatesFailed => {
                self.stop().await;
                Err(WatchError::UpdaterStopped("too many inventory load errors".to_string()).into())
            }
        }
    }

    pub async fn stop(self) {
        self.watch.stop();
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {e}");
            }
        }
    }
}
