// SPDX-License-Identifier: GPL-3.0-only

//! Live uevent subscription over a `NETLINK_KOBJECT_UEVENT` socket

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, ControlMessageOwned, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
    UnixCredentials, bind, recvmsg, setsockopt, socket, sockopt,
};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::EventSource;
use super::uevent::parse_message;
use crate::event::{DeviceEvent, DeviceEventStream};
use crate::{Result, WatchError};

const RECEIVE_BUFFER_LEN: usize = 8192;
const DEFAULT_CAPACITY: usize = 256;

/// Netlink multicast group to listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetlinkGroup {
    /// Raw kernel uevents, without udev properties such as `DEVLINKS`.
    Kernel,
    /// Events re-broadcast by udevd after rule processing.
    #[default]
    Udev,
}

impl NetlinkGroup {
    fn mask(self) -> u32 {
        match self {
            NetlinkGroup::Kernel => 1,
            NetlinkGroup::Udev => 2,
        }
    }

    fn trusts(self, datagram: &Datagram) -> bool {
        match self {
            NetlinkGroup::Kernel => {
                datagram.sender_pid == Some(0) && datagram.sender_uid.is_none_or(|uid| uid == 0)
            }
            NetlinkGroup::Udev => {
                datagram.sender_pid.is_some_and(|pid| pid != 0) && datagram.sender_uid == Some(0)
            }
        }
    }
}

struct Datagram {
    len: usize,
    sender_pid: Option<u32>,
    sender_uid: Option<u32>,
    truncated: bool,
}

/// Event source backed by the kernel uevent netlink socket.
#[derive(Debug, Clone)]
pub struct NetlinkSource {
    group: NetlinkGroup,
    capacity: usize,
}

impl NetlinkSource {
    pub fn new(group: NetlinkGroup) -> Self {
        Self {
            group,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Number of decoded events buffered before the reader waits for the consumer.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl Default for NetlinkSource {
    fn default() -> Self {
        Self::new(NetlinkGroup::default())
    }
}

impl EventSource for NetlinkSource {
    /// Must be called from within a tokio runtime.
    fn subscribe(&self, subsystem: &str, cancel: CancellationToken) -> Result<DeviceEventStream> {
        let socket = open_socket(self.group)?;
        let socket = AsyncFd::with_interest(socket, Interest::READABLE)?;
        let (sender, stream) = DeviceEventStream::channel(self.capacity);

        tracing::debug!(
            "Subscribed to {:?} uevents for subsystem {subsystem}",
            self.group
        );
        tokio::spawn(read_events(
            socket,
            self.group,
            subsystem.to_string(),
            sender,
            cancel,
        ));

        Ok(stream)
    }
}

fn subscribe_error(e: Errno) -> WatchError {
    if matches!(e, Errno::EACCES | Errno::EPERM) {
        WatchError::PermissionDenied(format!("Cannot open uevent netlink socket: {e}"))
    } else {
        WatchError::SourceUnavailable(format!("uevent netlink socket: {e}"))
    }
}

fn open_socket(group: NetlinkGroup) -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(subscribe_error)?;

    // udevd messages are only trusted with root credentials attached.
    setsockopt(&fd, sockopt::PassCred, &true).map_err(subscribe_error)?;
    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, group.mask())).map_err(subscribe_error)?;

    Ok(fd)
}

fn receive(fd: RawFd, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut control = nix::cmsg_space!(UnixCredentials);
    let msg = recvmsg::<NetlinkAddr>(fd, &mut iov, Some(&mut control), MsgFlags::empty())?;

    let mut sender_uid = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmCredentials(cred) = cmsg {
            sender_uid = Some(cred.uid());
        }
    }

    Ok(Datagram {
        len: msg.bytes,
        sender_pid: msg.address.map(|addr| addr.pid()),
        sender_uid,
        truncated: msg.flags.contains(MsgFlags::MSG_TRUNC),
    })
}

async fn read_events(
    socket: AsyncFd<OwnedFd>,
    group: NetlinkGroup,
    subsystem: String,
    sender: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];

    loop {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sender.closed() => break,
            ready = socket.readable() => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::error!("uevent socket failed: {e}");
                    break;
                }
            },
        };

        let received = guard.try_io(|inner| receive(inner.as_raw_fd(), &mut buf));
        drop(guard);

        let datagram = match received {
            Ok(Ok(datagram)) => datagram,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                // ENOBUFS means the kernel dropped events; keep listening.
                tracing::warn!("Failed to receive uevent: {e}");
                continue;
            }
            Err(_would_block) => continue,
        };

        if !group.trusts(&datagram) {
            tracing::debug!(
                "Dropping uevent from untrusted sender pid={:?} uid={:?}",
                datagram.sender_pid,
                datagram.sender_uid
            );
            continue;
        }
        if datagram.truncated {
            tracing::warn!("Dropping truncated uevent ({} bytes)", datagram.len);
            continue;
        }

        let event = match parse_message(&buf[..datagram.len]) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("Dropping uevent: {e}");
                continue;
            }
        };

        if event.subsystem.as_deref() != Some(subsystem.as_str()) {
            continue;
        }

        if sender.send(event).await.is_err() {
            break;
        }
    }

    tracing::debug!("uevent reader exiting");
}
