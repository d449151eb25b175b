// SPDX-License-Identifier: GPL-3.0-only

//! Device event sources
//!
//! A source opens a subscription filtered to one device class and delivers
//! its events, in order, through a [`DeviceEventStream`] until the given
//! cancellation token fires.

pub mod channel;
pub mod netlink;
pub mod uevent;

pub use channel::ChannelSource;
pub use netlink::{NetlinkGroup, NetlinkSource};
pub use uevent::parse_message;

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::event::DeviceEventStream;

pub trait EventSource: Send + Sync {
    /// Open a live subscription for `subsystem` devices.
    ///
    /// Failures to set up the transport are returned to the caller and not
    /// retried.
    fn subscribe(&self, subsystem: &str, cancel: CancellationToken) -> Result<DeviceEventStream>;
}
