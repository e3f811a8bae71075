// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Processing of `lsblk --pairs` output

use std::borrow::Cow;

/// One row of `lsblk --output=NAME,LABEL,PKNAME,MOUNTPOINT --pairs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device<'a> {
    /// Kernel name, i.e. `sda3`
    pub name: Cow<'a, str>,

    /// Filesystem label, i.e. `system-a`
    pub label: Option<Cow<'a, str>>,

    /// Kernel name of the parent disk
    pub parent: Option<Cow<'a, str>>,

    /// Where the device is mounted, if at all
    pub mountpoint: Option<Cow<'a, str>>,
}

/// Device table for iterating `lsblk` rows
#[derive(Debug, Default)]
pub struct Table {
    data: String,
}

impl Table {
    /// New Table parser for string
    ///
    /// Arguments:
    ///
    /// `data` - Some owned string
    pub fn new(data: String) -> Self {
        Self { data }
    }

    /// Iterate all devices (no copy unless a value was escaped)
    pub fn iter(&self) -> impl Iterator<Item = Device> {
        self.data.lines().filter_map(|line| {
            let mut device = Device {
                name: Cow::Borrowed(""),
                label: None,
                parent: None,
                mountpoint: None,
            };
            for (key, value) in pairs(line) {
                let value = if value.is_empty() { None } else { Some(value) };
                match key {
                    "NAME" => device.name = value?,
                    "LABEL" => device.label = value,
                    "PKNAME" => device.parent = value,
                    "MOUNTPOINT" => device.mountpoint = value,
                    _ => {}
                }
            }
            if device.name.is_empty() {
                None
            } else {
                Some(device)
            }
        })
    }
}

/// Split a line of `KEY="value"` pairs
fn pairs(line: &str) -> Vec<(&str, Cow<'_, str>)> {
    let mut out = vec![];
    let mut rest = line.trim_start();
    while let Some((key, tail)) = rest.split_once("=\"") {
        // lsblk escapes embedded quotes, so the next quote always terminates
        let Some(end) = tail.find('"') else {
            break;
        };
        out.push((key.trim(), unescape(&tail[..end])));
        rest = tail[end + 1..].trim_start();
    }
    out
}

/// Decode `\xNN` escapes emitted by lsblk for unsafe characters
fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains("\\x") {
        return Cow::Borrowed(raw);
    }
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(byte) = hex {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&decoded).into_owned())
}
