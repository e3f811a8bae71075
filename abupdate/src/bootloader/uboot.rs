// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! U-Boot management
//!
//! Assumes the device's u-boot supports `CONFIG_SUPPORT_RAW_INITRD`, so a
//! standard kernel + initrd can be booted straight from the vfat boot
//! partition. The main `uEnv.txt` sources `snappy-system.txt`, which holds
//! the variables we manage.

use std::path::PathBuf;

use crate::{partition::Slot, Configuration, ConfigFile};

use super::{Common, Error};

/// Same value as used in `hardware.yaml`
pub const NAME: &str = "u-boot";

pub const BIND_MOUNTS: &[&str] = &[];

const BOOT_DIR: &str = "/boot/uboot";
const CONFIG_FILE: &str = "/boot/uboot/uEnv.txt";
const ENV_FILE: &str = "/boot/uboot/snappy-system.txt";

/// Created by u-boot itself while in try mode. Removing it tells u-boot
/// the partition is good.
const STAMP_FILE: &str = "/boot/uboot/snappy-stamp.txt";

/// U-Boot specific bootloader behaviours
#[derive(Debug)]
pub struct Loader {
    pub(super) common: Common,
    config_file: PathBuf,
    stamp_file: PathBuf,
}

impl Loader {
    /// Crude heuristic: the main config file exists
    pub fn installed(config: &Configuration) -> bool {
        config.path(CONFIG_FILE).exists()
    }

    pub(super) fn new(config: &Configuration, current: &Slot, other: Option<&Slot>) -> Self {
        let env = ConfigFile::new(config.path(ENV_FILE));
        Self {
            common: Common::new(config, BOOT_DIR, env, current, other),
            config_file: config.path(CONFIG_FILE),
            stamp_file: config.path(STAMP_FILE),
        }
    }

    pub(super) fn is_installed(&self) -> bool {
        self.config_file.exists()
    }

    pub(super) fn mark_current_boot_successful(&self) -> Result<(), Error> {
        self.common.mark_current_boot_successful(&[], Some(&self.stamp_file))
    }
}
