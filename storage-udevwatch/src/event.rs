// SPDX-License-Identifier: GPL-3.0-only

//! Device events as reported by the kernel/udev

use std::collections::HashMap;
use std::fmt;

use futures::stream::Stream;
use futures::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::{Result, WatchError};

/// Kernel uevent action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
    Other(String),
}

impl Action {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "add" => Action::Add,
            "remove" => Action::Remove,
            "change" => Action::Change,
            "move" => Action::Move,
            "online" => Action::Online,
            "offline" => Action::Offline,
            "bind" => Action::Bind,
            "unbind" => Action::Unbind,
            other => Action::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
            Action::Move => "move",
            Action::Online => "online",
            Action::Offline => "offline",
            Action::Bind => "bind",
            Action::Unbind => "unbind",
            Action::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One block device notification.
///
/// `fs_type` distinguishes a missing `ID_FS_TYPE` (`None`) from an empty one
/// (`Some("")`); the latter is what udev reports after a signature wipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: Action,
    pub device_name: Option<String>,
    pub device_links: Vec<String>,
    pub fs_type: Option<String>,
    pub subsystem: Option<String>,
    pub devpath: Option<String>,
    pub seqnum: Option<u64>,
}

impl DeviceEvent {
    pub fn new(action: Action, device_name: impl Into<String>) -> Self {
        Self {
            action,
            device_name: Some(device_name.into()),
            device_links: Vec::new(),
            fs_type: None,
            subsystem: Some("block".to_string()),
            devpath: None,
            seqnum: None,
        }
    }

    pub fn with_links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_links = links.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type.into());
        self
    }

    /// Build an event from a udev property map.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let action = properties
            .get("ACTION")
            .map(|raw| Action::parse(raw))
            .ok_or_else(|| WatchError::MalformedEvent("missing ACTION".to_string()))?;

        let device_name = properties
            .get("DEVNAME")
            .filter(|name| !name.is_empty())
            .map(|name| normalize_devname(name));

        let device_links = properties
            .get("DEVLINKS")
            .map(|links| links.split_whitespace().map(ToOwned::to_owned).collect())
            .unwrap_or_default();

        let seqnum = match properties.get("SEQNUM") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                WatchError::MalformedEvent(format!("invalid SEQNUM: {raw}"))
            })?),
            None => None,
        };

        Ok(Self {
            action,
            device_name,
            device_links,
            fs_type: properties.get("ID_FS_TYPE").cloned(),
            subsystem: properties.get("SUBSYSTEM").cloned(),
            devpath: properties.get("DEVPATH").cloned(),
            seqnum,
        })
    }
}

// The kernel reports DEVNAME relative to /dev; udev reports the full path.
fn normalize_devname(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/dev/{name}")
    }
}

/// Ordered stream of device events for one subscription.
pub struct DeviceEventStream {
    receiver: mpsc::Receiver<DeviceEvent>,
}

impl DeviceEventStream {
    pub fn new(receiver: mpsc::Receiver<DeviceEvent>) -> Self {
        Self { receiver }
    }

    /// Create a stream together with the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<DeviceEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self::new(receiver))
    }

    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.receiver.recv().await
    }
}

impl Stream for DeviceEventStream {
    type Item = DeviceEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builds_event_from_udev_properties() {
        let event = DeviceEvent::from_properties(&props(&[
            ("ACTION", "change"),
            ("DEVNAME", "/dev/dm-7"),
            (
                "DEVLINKS",
                "/dev/mapper/vgtest-lvtest /dev/vgtest/lvtest  /dev/disk/by-id/dm-name-vgtest-lvtest",
            ),
            ("ID_FS_TYPE", "LVM2_member"),
            ("SUBSYSTEM", "block"),
            ("SEQNUM", "4711"),
        ]))
        .unwrap();

        assert_eq!(event.action, Action::Change);
        assert_eq!(event.device_name.as_deref(), Some("/dev/dm-7"));
        assert_eq!(
            event.device_links,
            vec![
                "/dev/mapper/vgtest-lvtest",
                "/dev/vgtest/lvtest",
                "/dev/disk/by-id/dm-name-vgtest-lvtest"
            ]
        );
        assert_eq!(event.fs_type.as_deref(), Some("LVM2_member"));
        assert_eq!(event.seqnum, Some(4711));
    }

    #[test]
    fn keeps_empty_and_absent_fs_type_apart() {
        let empty = DeviceEvent::from_properties(&props(&[
            ("ACTION", "change"),
            ("DEVNAME", "/dev/sdb"),
            ("ID_FS_TYPE", ""),
        ]))
        .unwrap();
        let absent =
            DeviceEvent::from_properties(&props(&[("ACTION", "change"), ("DEVNAME", "/dev/sdb")]))
                .unwrap();

        assert_eq!(empty.fs_type, Some(String::new()));
        assert_eq!(absent.fs_type, None);
        assert!(absent.device_links.is_empty());
    }

    #[test]
    fn kernel_devname_is_made_absolute() {
        let event =
            DeviceEvent::from_properties(&props(&[("ACTION", "add"), ("DEVNAME", "dm-3")]))
                .unwrap();
        assert_eq!(event.device_name.as_deref(), Some("/dev/dm-3"));
    }

    #[test]
    fn missing_action_is_malformed() {
        let err = DeviceEvent::from_properties(&props(&[("DEVNAME", "/dev/sda")])).unwrap_err();
        assert!(matches!(err, WatchError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn stream_yields_events_in_order_then_ends() {
        use futures::StreamExt;

        let (sender, stream) = DeviceEventStream::channel(4);
        sender.send(DeviceEvent::new(Action::Change, "/dev/sda")).await.unwrap();
        sender.send(DeviceEvent::new(Action::Remove, "/dev/sdb")).await.unwrap();
        drop(sender);

        let actions: Vec<Action> = stream.map(|event| event.action).collect().await;
        assert_eq!(actions, vec![Action::Change, Action::Remove]);
    }

    #[test]
    fn unknown_actions_round_trip_their_name() {
        assert_eq!(Action::parse("frobnicate").as_str(), "frobnicate");
        assert_eq!(Action::parse("change"), Action::Change);
    }
}
