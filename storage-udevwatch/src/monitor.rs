// SPDX-License-Identifier: GPL-3.0-only

//! Monitor lifecycle and the event → resync chain

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{DeviceEvent, DeviceEventStream};
use crate::filter::RelevanceFilter;
use crate::gate::CoalescingGate;
use crate::source::EventSource;
use crate::updater::Resync;
use crate::worker::{Job, JobQueue};
use crate::{Result, WatchError};

const DEFAULT_SUBSYSTEM: &str = "block";

/// Turns relevant events into at most one queued resync job.
pub struct ResyncTrigger {
    filter: RelevanceFilter,
    gate: Arc<CoalescingGate>,
    queue: Arc<dyn JobQueue>,
    resync: Arc<dyn Resync>,
}

impl ResyncTrigger {
    pub fn new(
        filter: RelevanceFilter,
        gate: Arc<CoalescingGate>,
        queue: Arc<dyn JobQueue>,
        resync: Arc<dyn Resync>,
    ) -> Self {
        Self {
            filter,
            gate,
            queue,
            resync,
        }
    }

    pub fn gate(&self) -> &Arc<CoalescingGate> {
        &self.gate
    }

    /// Returns true when the event caused a resync job to be queued.
    pub fn on_event(&self, event: &DeviceEvent) -> bool {
        if !self.filter.is_relevant(event) {
            return false;
        }

        tracing::debug!(
            action = %event.action,
            device = event.device_name.as_deref().unwrap_or_default(),
            fs_type = event.fs_type.as_deref().unwrap_or("<absent>"),
            "Block device change needs an inventory refresh"
        );
        self.trigger()
    }

    /// Queue a resync unless one is already pending.
    pub fn trigger(&self) -> bool {
        if !self.gate.try_enter() {
            tracing::trace!("Inventory resync already pending");
            return false;
        }

        let gate = self.gate.clone();
        let resync = self.resync.clone();
        let job = Job::new("udev-resync", async move {
            tracing::debug!("Processing udev event");
            // Release first so changes during the resync queue another one.
            gate.leave();
            resync.resync().await
        });

        match self.queue.submit(job) {
            Ok(()) => true,
            Err(e) => {
                self.gate.leave();
                tracing::error!("Failed to queue inventory resync: {e}");
                false
            }
        }
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    // The delivery task ends by itself when the source closes.
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Owns the event subscription and routes every event to a [`ResyncTrigger`].
pub struct UdevWatch {
    source: Arc<dyn EventSource>,
    trigger: Arc<ResyncTrigger>,
    subsystem: String,
    handle: Mutex<Option<MonitorHandle>>,
}

impl UdevWatch {
    pub fn new(source: Arc<dyn EventSource>, trigger: Arc<ResyncTrigger>) -> Self {
        Self {
            source,
            trigger,
            subsystem: DEFAULT_SUBSYSTEM.to_string(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<MonitorHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the event source and begin delivery.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.lock();
        if handle.as_ref().is_some_and(MonitorHandle::is_live) {
            return Err(WatchError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let events = self.source.subscribe(&self.subsystem, cancel.clone())?;
        let task = tokio::spawn(deliver_events(
            events,
            self.trigger.clone(),
            cancel.clone(),
        ));

        *handle = Some(MonitorHandle { cancel, task });
        tracing::info!("Monitoring udev for {} device changes", self.subsystem);
        Ok(())
    }

    /// Stop delivery. Returns false when nothing was running, including
    /// when the event source had already closed.
    ///
    /// Resync jobs already queued are left to finish.
    pub fn stop(&self) -> bool {
        let Some(handle) = self.lock().take() else {
            return false;
        };

        let was_live = handle.is_live();
        handle.cancel.cancel();
        handle.task.abort();
        if was_live {
            tracing::info!("Stopped udev monitoring");
        }
        was_live
    }

    /// False once stopped or once the event source has closed.
    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(MonitorHandle::is_live)
    }
}

impl Drop for UdevWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn deliver_events(
    mut events: DeviceEventStream,
    trigger: Arc<ResyncTrigger>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    tracing::error!("Device event source closed, udev monitoring stopped");
                    break;
                }
            },
        };

        trigger.on_event(&event);
    }

    tracing::debug!("udev delivery task exiting");
}
