// SPDX-License-Identifier: GPL-3.0-only

//! Decoding of netlink uevent datagrams
//!
//! Two framings arrive on `NETLINK_KOBJECT_UEVENT`:
//! - kernel: `action@devpath\0KEY=VALUE\0...`
//! - udev: a `libudev\0` header followed by `KEY=VALUE\0...` properties at
//!   the offset given in the header

use std::collections::HashMap;

use crate::event::DeviceEvent;
use crate::{Result, WatchError};

const UDEV_PREFIX: &[u8] = b"libudev\0";
const UDEV_MAGIC: u32 = 0xfeed_cafe;
// prefix[8], magic, header_size, properties_off, properties_len,
// filter_subsystem_hash, filter_devtype_hash, filter_tag_bloom_hi/lo
const UDEV_HEADER_LEN: usize = 40;

pub fn parse_message(buf: &[u8]) -> Result<DeviceEvent> {
    let properties = if buf.starts_with(UDEV_PREFIX) {
        parse_udev(buf)?
    } else {
        parse_kernel(buf)?
    };

    DeviceEvent::from_properties(&properties)
}

fn read_u32(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    bytes
}

fn parse_udev(buf: &[u8]) -> Result<HashMap<String, String>> {
    if buf.len() < UDEV_HEADER_LEN {
        return Err(WatchError::MalformedEvent(format!(
            "libudev header truncated ({} bytes)",
            buf.len()
        )));
    }

    // Magic is network byte order, the remaining fields host order.
    let magic = u32::from_be_bytes(read_u32(buf, 8));
    if magic != UDEV_MAGIC {
        return Err(WatchError::MalformedEvent(format!(
            "unexpected libudev magic {magic:#010x}"
        )));
    }

    let properties_off = u32::from_ne_bytes(read_u32(buf, 16)) as usize;
    let properties_len = u32::from_ne_bytes(read_u32(buf, 20)) as usize;

    let window = properties_off
        .checked_add(properties_len)
        .filter(|_| properties_off >= UDEV_HEADER_LEN)
        .and_then(|end| buf.get(properties_off..end))
        .ok_or_else(|| {
            WatchError::MalformedEvent(format!(
                "property window {properties_off}+{properties_len} outside {} byte message",
                buf.len()
            ))
        })?;

    Ok(parse_properties(window))
}

fn parse_kernel(buf: &[u8]) -> Result<HashMap<String, String>> {
    let header_end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let header = String::from_utf8_lossy(&buf[..header_end]);
    let (action, devpath) = header.split_once('@').ok_or_else(|| {
        WatchError::MalformedEvent(format!("kernel uevent header without '@': {header}"))
    })?;

    let mut properties = parse_properties(buf.get(header_end + 1..).unwrap_or_default());
    properties
        .entry("ACTION".to_string())
        .or_insert_with(|| action.to_string());
    properties
        .entry("DEVPATH".to_string())
        .or_insert_with(|| devpath.to_string());

    Ok(properties)
}

fn parse_properties(bytes: &[u8]) -> HashMap<String, String> {
    bytes
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
