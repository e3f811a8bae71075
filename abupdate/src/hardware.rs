// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `hardware.yaml` support
//!
//! An update may ship device specific boot assets alongside a manifest
//! describing them, and the layout/bootloader the update was built for.

use std::{fs, io, path::Path, path::PathBuf, str::FromStr};

use serde::Deserialize;

use crate::Error;

/// Partition layout tag for systems with two root filesystem slots
pub const SYSTEM_AB: &str = "system-AB";

/// Representation of the hardware manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HardwareSpec {
    /// Kernel image, relative to the cache directory
    #[serde(default)]
    pub kernel: Option<PathBuf>,

    /// Initial ramdisk, relative to the cache directory
    #[serde(default)]
    pub initrd: Option<PathBuf>,

    /// Directory of device tree blobs, relative to the cache directory
    #[serde(default, rename = "dtbs")]
    pub dtb_dir: Option<PathBuf>,

    #[serde(default, rename = "partition-layout")]
    pub partition_layout: String,

    /// Must match [`crate::Bootloader::name`]
    #[serde(default)]
    pub bootloader: String,
}

impl FromStr for HardwareSpec {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl HardwareSpec {
    /// Load the manifest, `None` if the update carried no hardware part
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, Error> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No hardware spec at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        log::trace!("Reading hardware spec: {}", path.display());
        Ok(Some(Self::from_str(&text)?))
    }

    /// Does this layout need two root filesystem slots?
    pub fn requires_dual_partitions(&self) -> bool {
        self.partition_layout == SYSTEM_AB
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf, str::FromStr};

    use super::HardwareSpec;

    #[test]
    fn parse_manifest() {
        let spec = HardwareSpec::from_str(
            r#"
kernel: assets/vmlinuz
initrd: assets/initrd.img
dtbs: assets/dtbs
partition-layout: system-AB
bootloader: u-boot
hardware:
  dtb: am335x-boneblack.dtb
"#,
        )
        .expect("valid yaml");
        assert_eq!(spec.kernel, Some(PathBuf::from("assets/vmlinuz")));
        assert_eq!(spec.initrd, Some(PathBuf::from("assets/initrd.img")));
        assert_eq!(spec.dtb_dir, Some(PathBuf::from("assets/dtbs")));
        assert_eq!(spec.bootloader, "u-boot");
        assert!(spec.requires_dual_partitions());
    }

    #[test]
    fn missing_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = HardwareSpec::load(dir.path().join("hardware.yaml")).expect("absence is not an error");
        assert!(spec.is_none());

        fs::write(dir.path().join("hardware.yaml"), "bootloader: grub\n").unwrap();
        let spec = HardwareSpec::load(dir.path().join("hardware.yaml"))
            .expect("load")
            .expect("present");
        assert_eq!(spec.bootloader, "grub");
        assert!(spec.kernel.is_none());
        assert!(!spec.requires_dual_partitions());
    }
}
