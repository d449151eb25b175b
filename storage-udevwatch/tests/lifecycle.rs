// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use storage_udevwatch::{
    Action, ChannelSource, CoalescingGate, DeviceEvent, DeviceMatcher, DeviceRegistry,
    InventoryLoader, Job, JobQueue, LoadOptions, RelevanceFilter, Result, Resync, ResyncTrigger,
    StateUpdater, UdevWatch, WorkQueue,
};

/// Registry that reports every lookup.
struct ObservedRegistry {
    known: HashSet<String>,
    lookups: mpsc::UnboundedSender<String>,
}

impl DeviceRegistry for ObservedRegistry {
    fn contains(&self, identifier: &str) -> bool {
        let _ = self.lookups.send(identifier.to_string());
        self.known.contains(identifier)
    }
}

#[derive(Default)]
struct HeldQueue {
    jobs: Mutex<Vec<Job>>,
}

impl JobQueue for HeldQueue {
    fn submit(&self, job: Job) -> Result<()> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

impl HeldQueue {
    fn take(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

#[derive(Default)]
struct NoopResync {
    runs: AtomicUsize,
}

#[async_trait]
impl Resync for NoopResync {
    async fn resync(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    source: Arc<ChannelSource>,
    queue: Arc<HeldQueue>,
    resync: Arc<NoopResync>,
    gate: Arc<CoalescingGate>,
    lookups: mpsc::UnboundedReceiver<String>,
    watch: UdevWatch,
}

fn harness(known: &[&str]) -> Harness {
    let (lookups_tx, lookups) = mpsc::unbounded_channel();
    let registry = ObservedRegistry {
        known: known.iter().map(|s| s.to_string()).collect(),
        lookups: lookups_tx,
    };
    let source = Arc::new(ChannelSource::new(64));
    let queue = Arc::new(HeldQueue::default());
    let resync = Arc::new(NoopResync::default());
    let gate = Arc::new(CoalescingGate::new());
    let trigger = ResyncTrigger::new(
        RelevanceFilter::new(DeviceMatcher::new(Arc::new(registry))),
        gate.clone(),
        queue.clone(),
        resync.clone(),
    );
    let watch = UdevWatch::new(source.clone(), Arc::new(trigger));

    Harness {
        source,
        queue,
        resync,
        gate,
        lookups,
        watch,
    }
}

fn lvm_change(name: &str) -> DeviceEvent {
    DeviceEvent::new(Action::Change, name).with_fs_type("LVM2")
}

#[tokio::test]
async fn second_event_before_leave_is_coalesced() {
    let mut h = harness(&[]);
    h.watch.start().unwrap();

    assert!(h.source.inject(lvm_change("/dev/dm-9")));
    assert!(h.source.inject(lvm_change("/dev/dm-9")));
    assert_eq!(h.lookups.recv().await.as_deref(), Some("/dev/dm-9"));
    assert_eq!(h.lookups.recv().await.as_deref(), Some("/dev/dm-9"));

    let jobs = h.queue.take();
    assert_eq!(jobs.len(), 1);
    assert!(h.gate.is_pending());

    for job in jobs {
        job.run().await.unwrap();
    }
    assert_eq!(h.resync.runs.load(Ordering::SeqCst), 1);
    assert!(!h.gate.is_pending());

    assert!(h.source.inject(lvm_change("/dev/dm-9")));
    assert_eq!(h.lookups.recv().await.as_deref(), Some("/dev/dm-9"));
    assert_eq!(h.queue.take().len(), 1);

    assert!(h.watch.stop());
}

#[tokio::test]
async fn wiped_alias_of_tracked_volume_triggers_resync() {
    let mut h = harness(&["/dev/mapper/vgtest-lvtest"]);
    h.watch.start().unwrap();

    let wiped = DeviceEvent::new(Action::Change, "/dev/dm-7")
        .with_links(["/dev/disk/by-id/dm-name-vgtest-lvtest", "/dev/mapper/vgtest-lvtest"]);
    assert!(h.source.inject(wiped));

    assert_eq!(h.lookups.recv().await.as_deref(), Some("/dev/dm-7"));
    assert_eq!(
        h.lookups.recv().await.as_deref(),
        Some("/dev/disk/by-id/dm-name-vgtest-lvtest")
    );
    assert_eq!(
        h.lookups.recv().await.as_deref(),
        Some("/dev/mapper/vgtest-lvtest")
    );
    assert_eq!(h.queue.take().len(), 1);

    assert!(h.watch.stop());
}

#[tokio::test]
async fn start_then_stop_without_events_does_nothing() {
    let mut h = harness(&[]);

    h.watch.start().unwrap();
    assert!(h.watch.stop());
    assert!(!h.watch.stop());

    assert!(h.queue.take().is_empty());
    assert!(h.lookups.try_recv().is_err());
    assert!(!h.gate.is_pending());
}

#[tokio::test]
async fn events_after_stop_are_not_delivered() {
    let mut h = harness(&[]);

    h.watch.start().unwrap();
    assert!(h.watch.stop());
    assert!(!h.source.inject(lvm_change("/dev/dm-9")));

    tokio::task::yield_now().await;
    assert!(h.queue.take().is_empty());
    assert!(h.lookups.try_recv().is_err());
}

struct SignallingLoader {
    loads: mpsc::UnboundedSender<LoadOptions>,
}

#[async_trait]
impl InventoryLoader for SignallingLoader {
    async fn load(&self, options: LoadOptions) -> Result<usize> {
        let _ = self.loads.send(options);
        Ok(1)
    }
}

#[tokio::test]
async fn relevant_event_reloads_inventory_through_worker_and_updater() {
    let shutdown = CancellationToken::new();
    let (loads_tx, mut loads) = mpsc::unbounded_channel();
    let (updater, updater_task) = StateUpdater::spawn(
        Arc::new(SignallingLoader { loads: loads_tx }),
        Duration::from_millis(1),
        shutdown.clone(),
    );
    let (queue, worker_task) = WorkQueue::spawn(shutdown.clone());

    let source = Arc::new(ChannelSource::new(16));
    let gate = Arc::new(CoalescingGate::new());
    let registry: HashSet<String> = HashSet::new();
    let trigger = ResyncTrigger::new(
        RelevanceFilter::new(DeviceMatcher::new(Arc::new(registry))),
        gate.clone(),
        Arc::new(queue),
        Arc::new(updater),
    );
    let watch = UdevWatch::new(source.clone(), Arc::new(trigger));
    watch.start().unwrap();

    assert!(source.inject(lvm_change("/dev/sdc")));
    assert_eq!(loads.recv().await, Some(LoadOptions::default()));

    assert!(watch.stop());
    shutdown.cancel();
    worker_task.await.unwrap();
    updater_task.await.unwrap();
    assert!(!gate.is_pending());
}
