// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk probe/query APIs

use std::path::PathBuf;

use super::lsblk::{Device, Table};

/// Filesystem labels identifying the two root filesystem slots
pub const ROOT_LABELS: [&str; 2] = ["system-a", "system-b"];

/// A Disk probe to query disks
#[derive(Debug)]
pub struct Probe {
    /// location of /dev
    pub(super) devfs: PathBuf,

    /// Block devices
    pub(super) table: Table,
}

impl Probe {
    /// All devices carrying one of the [`ROOT_LABELS`]
    pub fn root_partitions(&self) -> impl Iterator<Item = Device> {
        self.table
            .iter()
            .filter(|d| d.label.as_deref().is_some_and(|l| ROOT_LABELS.contains(&l)))
    }

    /// The root filesystem slot currently mounted at `/`
    pub fn root_partition(&self) -> Result<Device, super::Error> {
        self.root_partitions()
            .find(|d| d.mountpoint.as_deref() == Some("/"))
            .ok_or(super::Error::NoRootPartition)
    }

    /// The alternate root filesystem slot on the same disk, if this is a dual partition system
    pub fn other_root_partition(&self) -> Option<Device> {
        let root = self.root_partition().ok()?;
        self.root_partitions()
            .find(|d| d.name != root.name && d.label != root.label && d.parent == root.parent)
    }

    /// Returns true if both root filesystem slots exist
    pub fn dual_root_partitions(&self) -> bool {
        self.other_root_partition().is_some()
    }

    /// Full device node path for the given device
    pub fn device_path(&self, device: &Device) -> PathBuf {
        self.devfs.join(device.name.as_ref())
    }
}
