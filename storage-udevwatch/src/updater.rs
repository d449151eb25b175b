// SPDX-License-Identifier: GPL-3.0-only

//! Serialized, coalescing inventory reloads
//!
//! Reloading the inventory reflects every change made before it started, so
//! running one load per request is wasted work. A single task owns all loads;
//! requests that queue up while a load runs are answered together by the
//! next one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Result, WatchError};

/// Consecutive load failures after which the updater gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Full resync of the tracked inventory.
#[async_trait]
pub trait Resync: Send + Sync {
    async fn resync(&self) -> Result<()>;
}

/// Rebuilds the inventory from system state, returning the number of changes.
#[async_trait]
pub trait InventoryLoader: Send + Sync {
    async fn load(&self, options: LoadOptions) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub refresh: bool,
    pub emit_signal: bool,
    pub cache_refresh: bool,
    pub log: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            refresh: true,
            emit_signal: true,
            cache_refresh: true,
            log: true,
        }
    }
}

impl LoadOptions {
    /// Combine queued requests; an option set by any of them is honoured.
    pub fn merge<I>(options: I) -> Option<Self>
    where
        I: IntoIterator<Item = LoadOptions>,
    {
        options.into_iter().reduce(|acc, next| Self {
            refresh: acc.refresh || next.refresh,
            emit_signal: acc.emit_signal || next.emit_signal,
            cache_refresh: acc.cache_refresh || next.cache_refresh,
            log: acc.log || next.log,
        })
    }
}

struct UpdateRequest {
    options: LoadOptions,
    reply: oneshot::Sender<Result<usize>>,
}

#[derive(Default)]
struct Deferred {
    pending: AtomicBool,
    notify: Notify,
}

/// Handle to the inventory update task.
#[derive(Clone)]
pub struct StateUpdater {
    sender: mpsc::UnboundedSender<UpdateRequest>,
    deferred: Arc<Deferred>,
}

impl StateUpdater {
    /// Start the update task.
    ///
    /// `shutdown` stops the task and is cancelled by it after
    /// [`MAX_CONSECUTIVE_FAILURES`] failed loads in a row.
    pub fn spawn(
        loader: Arc<dyn InventoryLoader>,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let deferred = Arc::new(Deferred::default());
        let handle = tokio::spawn(update_loop(
            loader,
            receiver,
            deferred.clone(),
            retry_delay,
            shutdown,
        ));
        (Self { sender, deferred }, handle)
    }

    /// Queue a load and wait for the load that serves it.
    pub async fn load(&self, options: LoadOptions) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(UpdateRequest { options, reply })
            .map_err(|_| WatchError::UpdaterStopped("update task is not running".to_string()))?;

        response
            .await
            .map_err(|_| WatchError::UpdaterStopped("update request dropped".to_string()))?
    }

    /// Ask for a refresh without waiting for it.
    pub fn event(&self) {
        self.deferred.pending.store(true, Ordering::SeqCst);
        self.deferred.notify.notify_one();
    }
}

#[async_trait]
impl Resync for StateUpdater {
    async fn resync(&self) -> Result<()> {
        let changes = self.load(LoadOptions::default()).await?;
        tracing::debug!("Inventory resync complete, {changes} change(s)");
        Ok(())
    }
}

async fn update_loop(
    loader: Arc<dyn InventoryLoader>,
    mut receiver: mpsc::UnboundedReceiver<UpdateRequest>,
    deferred: Arc<Deferred>,
    retry_delay: Duration,
    shutdown: CancellationToken,
) {
    let mut queued: Vec<UpdateRequest> = Vec::new();
    let mut failures = 0u32;

    loop {
        let deferred_refresh = deferred.pending.swap(false, Ordering::SeqCst);

        if queued.is_empty() && !deferred_refresh {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => queued.push(request),
                    None => break,
                },
                _ = deferred.notify.notified() => continue,
            }
        }

        while let Ok(request) = receiver.try_recv() {
            queued.push(request);
        }

        if queued.len() > 1 {
            tracing::debug!("Processing {} updates", queued.len());
        }

        let options =
            LoadOptions::merge(queued.iter().map(|request| request.options)).unwrap_or_default();

        match loader.load(options).await {
            Ok(changes) => {
                failures = 0;
                for request in queued.drain(..) {
                    let _ = request.reply.send(Ok(changes));
                }
            }
            Err(e) => {
                failures += 1;
                tracing::error!(
                    "Inventory load failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {e}"
                );

                if failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!("Too many inventory load errors, stopping updates");
                    let reason = e.to_string();
                    for request in queued.drain(..) {
                        let _ = request
                            .reply
                            .send(Err(WatchError::LoadFailed(reason.clone())));
                    }
                    shutdown.cancel();
                    break;
                }

                // Waiters stay queued for the retry; a bare refresh is re-armed.
                if deferred_refresh {
                    deferred.pending.store(true, Ordering::SeqCst);
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }

    receiver.close();
    while let Ok(request) = receiver.try_recv() {
        queued.push(request);
    }
    for request in queued {
        let _ = request.reply.send(Err(WatchError::UpdaterStopped(
            "update task exiting".to_string(),
        )));
    }
    tracing::debug!("Update task exiting");
}
