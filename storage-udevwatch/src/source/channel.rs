// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::EventSource;
use crate::Result;
use crate::event::{DeviceEvent, DeviceEventStream};

struct Subscriber {
    subsystem: String,
    sender: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ChannelState {
    subscriber: Option<Subscriber>,
    subscriptions: usize,
}

/// In-process event source fed by [`ChannelSource::inject`].
///
/// Useful to forward events from another monitor or to replay recorded
/// events. Only the most recent subscription receives events.
pub struct ChannelSource {
    capacity: usize,
    state: Mutex<ChannelState>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver an event to the active subscription.
    ///
    /// Returns false when nobody is subscribed, the event belongs to another
    /// subsystem, or the subscription buffer is full.
    pub fn inject(&self, event: DeviceEvent) -> bool {
        let state = self.lock();
        let Some(subscriber) = state.subscriber.as_ref() else {
            return false;
        };

        if subscriber.cancel.is_cancelled()
            || event.subsystem.as_deref() != Some(subscriber.subsystem.as_str())
        {
            return false;
        }

        subscriber.sender.try_send(event).is_ok()
    }

    /// Number of subscriptions opened so far.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }
}

impl EventSource for ChannelSource {
    fn subscribe(&self, subsystem: &str, cancel: CancellationToken) -> Result<DeviceEventStream> {
        let (sender, stream) = DeviceEventStream::channel(self.capacity);
        let mut state = self.lock();
        state.subscriber = Some(Subscriber {
            subsystem: subsystem.to_string(),
            sender,
            cancel,
        });
        state.subscriptions += 1;
        Ok(stream)
    }
}
