// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GRUB management
//!
//! Variables live in `grubenv`, a fixed 1 KiB block that `grub.cfg` loads
//! at boot. `snappy_trial_boot` is raised by `grub.cfg` when it starts a
//! try boot, and must be reset once that boot is confirmed.

use std::path::PathBuf;

use crate::{config_file::Change, partition::Slot, Configuration, ConfigFile};

use super::{Common, Error};

/// Same value as used in `hardware.yaml`
pub const NAME: &str = "grub";

/// `grub.cfg` generation inside the other rootfs needs our boot directory
pub const BIND_MOUNTS: &[&str] = &["/boot/grub"];

const BOOT_DIR: &str = "/boot/grub";
const CONFIG_FILE: &str = "/boot/grub/grub.cfg";
const ENV_FILE: &str = "/boot/grub/grubenv";

const ENV_HEADER: &str = "# GRUB Environment Block";
const ENV_SIZE: usize = 1024;

const TRIAL_BOOT_VAR: &str = "snappy_trial_boot";

/// GRUB specific bootloader behaviours
#[derive(Debug)]
pub struct Loader {
    pub(super) common: Common,
    config_file: PathBuf,
}

impl Loader {
    pub fn installed(config: &Configuration) -> bool {
        config.path(CONFIG_FILE).exists()
    }

    pub(super) fn new(config: &Configuration, current: &Slot, other: Option<&Slot>) -> Self {
        let env = ConfigFile::new(config.path(ENV_FILE)).with_block(ENV_HEADER, ENV_SIZE);
        Self {
            common: Common::new(config, BOOT_DIR, env, current, other),
            config_file: config.path(CONFIG_FILE),
        }
    }

    pub(super) fn is_installed(&self) -> bool {
        self.config_file.exists()
    }

    /// GRUB has no stamp file, the trial flag plays that role
    pub(super) fn mark_current_boot_successful(&self) -> Result<(), Error> {
        self.common
            .mark_current_boot_successful(&[Change::new(TRIAL_BOOT_VAR, "0")], None)
    }
}
