// SPDX-License-Identifier: GPL-3.0-only

use crate::event::{Action, DeviceEvent};
use crate::matcher::DeviceMatcher;

/// Marker found in the `ID_FS_TYPE` of LVM physical volumes (`LVM2_member`).
pub const DEFAULT_MANAGED_SIGNATURE: &str = "LVM";

/// Decides whether a device event warrants a full inventory resync.
///
/// Only `change` events are considered; add/remove arrive through the
/// authoritative notification channel. A managed signature on an unknown
/// device means something outside our control created it, while an empty or
/// missing signature on a known device usually follows a wipe.
#[derive(Clone)]
pub struct RelevanceFilter {
    matcher: DeviceMatcher,
    managed_signature: String,
}

impl RelevanceFilter {
    pub fn new(matcher: DeviceMatcher) -> Self {
        Self::with_signature(matcher, DEFAULT_MANAGED_SIGNATURE)
    }

    pub fn with_signature(matcher: DeviceMatcher, managed_signature: impl Into<String>) -> Self {
        Self {
            matcher,
            managed_signature: managed_signature.into(),
        }
    }

    pub fn is_relevant(&self, event: &DeviceEvent) -> bool {
        if event.action != Action::Change {
            return false;
        }

        if event.device_name.is_none() {
            tracing::warn!(
                devpath = event.devpath.as_deref().unwrap_or("<unknown>"),
                "Ignoring change event without a device name"
            );
            return false;
        }

        match event.fs_type.as_deref() {
            Some(fs_type) if !fs_type.is_empty() => {
                if fs_type.contains(self.managed_signature.as_str()) {
                    !self.matcher.known(event)
                } else {
                    false
                }
            }
            _ => self.matcher.known(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::registry::DeviceRegistry;

    #[derive(Default)]
    struct CountingRegistry {
        known: HashSet<String>,
        lookups: AtomicUsize,
    }

    impl DeviceRegistry for CountingRegistry {
        fn contains(&self, identifier: &str) -> bool {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.known.contains(identifier)
        }
    }

    fn registry(known: &[&str]) -> Arc<CountingRegistry> {
        Arc::new(CountingRegistry {
            known: known.iter().map(|s| s.to_string()).collect(),
            lookups: AtomicUsize::new(0),
        })
    }

    fn filter(registry: &Arc<CountingRegistry>) -> RelevanceFilter {
        RelevanceFilter::new(DeviceMatcher::new(registry.clone()))
    }

    #[test]
    fn non_change_actions_are_never_relevant() {
        let registry = registry(&["/dev/sdb"]);
        let filter = filter(&registry);

        for action in [
            Action::Add,
            Action::Remove,
            Action::Move,
            Action::Other("offline".to_string()),
        ] {
            let wiped = DeviceEvent::new(action.clone(), "/dev/sdb").with_fs_type("");
            let lvm = DeviceEvent::new(action, "/dev/dm-9").with_fs_type("LVM2_member");
            assert!(!filter.is_relevant(&wiped));
            assert!(!filter.is_relevant(&lvm));
        }
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn managed_signature_is_relevant_only_for_unknown_devices() {
        let unknown = DeviceEvent::new(Action::Change, "/dev/dm-9").with_fs_type("LVM2");
        assert!(filter(&registry(&[])).is_relevant(&unknown));

        let by_name = registry(&["/dev/dm-9"]);
        assert!(!filter(&by_name).is_relevant(&unknown));

        let aliased = DeviceEvent::new(Action::Change, "/dev/dm-9")
            .with_links(["/dev/mapper/vg-pv"])
            .with_fs_type("LVM2_member");
        assert!(!filter(&registry(&["/dev/mapper/vg-pv"])).is_relevant(&aliased));
    }

    #[test]
    fn other_signatures_are_ignored() {
        let registry = registry(&["/dev/sdb1"]);
        let event = DeviceEvent::new(Action::Change, "/dev/sdb1").with_fs_type("ext4");
        assert!(!filter(&registry).is_relevant(&event));

        let unknown = DeviceEvent::new(Action::Change, "/dev/sdc1").with_fs_type("xfs");
        assert!(!filter(&registry).is_relevant(&unknown));
    }

    #[test]
    fn empty_signature_is_relevant_only_for_known_devices() {
        let event = DeviceEvent::new(Action::Change, "/dev/sdb").with_fs_type("");
        assert!(filter(&registry(&["/dev/sdb"])).is_relevant(&event));
        assert!(!filter(&registry(&["/dev/sdc"])).is_relevant(&event));
    }

    #[test]
    fn absent_signature_is_relevant_only_for_known_devices() {
        let event = DeviceEvent::new(Action::Change, "/dev/dm-7")
            .with_links(["/dev/mapper/vgtest-lvtest"]);
        assert_eq!(event.fs_type, None);

        assert!(filter(&registry(&["/dev/mapper/vgtest-lvtest"])).is_relevant(&event));
        assert!(!filter(&registry(&[])).is_relevant(&event));
    }

    #[test]
    fn change_without_device_name_is_ignored() {
        let registry = registry(&["/dev/mapper/vg-lv"]);
        let mut event = DeviceEvent::new(Action::Change, "unused").with_links(["/dev/mapper/vg-lv"]);
        event.device_name = None;

        assert!(!filter(&registry).is_relevant(&event));
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_signature_marker() {
        let filter = RelevanceFilter::with_signature(
            DeviceMatcher::new(registry(&[])),
            "linux_raid_member",
        );
        let raid = DeviceEvent::new(Action::Change, "/dev/sdd").with_fs_type("linux_raid_member");
        let lvm = DeviceEvent::new(Action::Change, "/dev/sdd").with_fs_type("LVM2_member");
        assert!(filter.is_relevant(&raid));
        assert!(!filter.is_relevant(&lvm));
    }
}
