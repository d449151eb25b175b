// SPDX-License-Identifier: GPL-3.0-only

//! Block device uevent watcher for the storage inventory
//!
//! This crate listens to kernel/udev block-device notifications and decides
//! whether the tracked device inventory needs a full resync:
//! - Device matching against the known-device registry (by name or alias)
//! - Relevance filtering of `change` events by filesystem signature
//! - A coalescing gate so at most one resync job is pending at a time
//! - Monitor lifecycle (idempotent start/stop of the event subscription)
//!
//! The work queue and the coalescing state updater are provided so a
//! daemon can run the resync without further plumbing.

pub mod error;
pub mod event;
pub mod filter;
pub mod gate;
pub mod matcher;
pub mod monitor;
pub mod registry;
pub mod source;
pub mod updater;
pub mod worker;

pub use error::{Result, WatchError};
pub use event::{Action, DeviceEvent, DeviceEventStream};
pub use filter::{DEFAULT_MANAGED_SIGNATURE, RelevanceFilter};
pub use gate::CoalescingGate;
pub use matcher::DeviceMatcher;
pub use monitor::{ResyncTrigger, UdevWatch};
pub use registry::DeviceRegistry;
pub use source::{ChannelSource, EventSource, NetlinkGroup, NetlinkSource};
pub use updater::{InventoryLoader, LoadOptions, Resync, StateUpdater};
pub use worker::{Job, JobQueue, WorkQueue};
