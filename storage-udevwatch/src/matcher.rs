// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use crate::event::DeviceEvent;
use crate::registry::DeviceRegistry;

/// Decides whether an event refers to a device the inventory already tracks.
///
/// Kernel names such as `/dev/dm-7` are rarely what the inventory is indexed
/// by, so the alias list is consulted when the primary name misses.
#[derive(Clone)]
pub struct DeviceMatcher {
    registry: Arc<dyn DeviceRegistry>,
}

impl DeviceMatcher {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }

    pub fn known(&self, event: &DeviceEvent) -> bool {
        if let Some(name) = event.device_name.as_deref()
            && self.registry.contains(name)
        {
            return true;
        }

        event
            .device_links
            .iter()
            .any(|link| self.registry.contains(link))
    }
}
