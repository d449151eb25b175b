// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;

/// Read-only view of the tracked device inventory.
///
/// Identifiers are device paths or aliases (`/dev/sdb1`, `/dev/mapper/vg-lv`).
/// Lookups must be cheap and free of side effects; they run on the event
/// delivery path.
pub trait DeviceRegistry: Send + Sync {
    fn contains(&self, identifier: &str) -> bool;
}

impl DeviceRegistry for HashSet<String> {
    fn contains(&self, identifier: &str) -> bool {
        HashSet::contains(self, identifier)
    }
}
