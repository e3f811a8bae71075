// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootloader APIs

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    bootvars::{BOOTMODE_TRY, BOOTMODE_VAR},
    partition::Slot,
    Configuration, HardwareSpec,
};

mod common;
pub use common::Common;

pub mod grub;
pub mod uboot;

/// Bootloader errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("no supported bootloader installed")]
    NoBootloader,

    #[error("bootloader is of type {found} but hardware spec requires {required}")]
    BootloaderMismatch { found: &'static str, required: String },

    #[error("hardware spec requires dual root partitions")]
    DualPartitionRequired,

    #[error("no dual root partition")]
    NoDualPartition,

    #[error("hardware spec asset path escapes the cache: {0}")]
    InvalidAssetPath(PathBuf),

    #[error("missing bootloader file: {0}")]
    MissingFile(PathBuf),

    #[error("i/o error: {0}")]
    IO(#[from] std::io::Error),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("glob: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("error: {0}")]
    Any(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Device and update payload disagree about the hardware topology, or the payload is malformed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NoBootloader
                | Error::BootloaderMismatch { .. }
                | Error::DualPartitionRequired
                | Error::InvalidAssetPath(_)
        )
    }
}

#[derive(Debug)]
pub enum Bootloader {
    UBoot(Box<uboot::Loader>),
    Grub(Box<grub::Loader>),
}

impl Bootloader {
    /// Construct the first installed bootloader, in priority order
    pub fn new(config: &Configuration, current: &Slot, other: Option<&Slot>) -> Result<Self, Error> {
        if uboot::Loader::installed(config) {
            log::debug!("detected u-boot");
            Ok(Bootloader::UBoot(Box::new(uboot::Loader::new(config, current, other))))
        } else if grub::Loader::installed(config) {
            log::debug!("detected grub");
            Ok(Bootloader::Grub(Box::new(grub::Loader::new(config, current, other))))
        } else {
            Err(Error::NoBootloader)
        }
    }

    /// State shared by all bootloader families
    pub fn common(&self) -> &Common {
        match &self {
            Bootloader::UBoot(u) => &u.common,
            Bootloader::Grub(g) => &g.common,
        }
    }

    /// Name as used by the hardware spec
    pub fn name(&self) -> &'static str {
        match &self {
            Bootloader::UBoot(_) => uboot::NAME,
            Bootloader::Grub(_) => grub::NAME,
        }
    }

    pub fn is_installed(&self) -> bool {
        match &self {
            Bootloader::UBoot(u) => u.is_installed(),
            Bootloader::Grub(g) => g.is_installed(),
        }
    }

    /// Boot the other rootfs next time, in try mode
    pub fn toggle_rootfs(&self) -> Result<(), Error> {
        self.common().toggle_rootfs()
    }

    /// Give the other slot a full copy of our boot files
    pub fn sync_boot_files(&self) -> Result<(), Error> {
        self.common().sync_boot_files()
    }

    /// Install the hardware specific assets staged by an update
    pub fn handle_assets(&self, hardware: &HardwareSpec) -> Result<(), Error> {
        self.common().handle_assets(self.name(), hardware)
    }

    pub fn get_all_boot_vars(&self) -> Result<Vec<String>, Error> {
        Ok(self.common().vars().get_all()?)
    }

    pub fn get_boot_var(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self.common().vars().get(name)?)
    }

    pub fn set_boot_var(&self, name: &str, value: &str) -> Result<(), Error> {
        Ok(self.common().vars().set(name, value)?)
    }

    pub fn clear_boot_var(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self.common().vars().clear(name)?)
    }

    /// Label of the running rootfs
    pub fn get_rootfs_name(&self) -> &str {
        self.common().rootfs_name()
    }

    /// Label of the other rootfs, from the partition layout
    pub fn get_other_rootfs_name(&self) -> Option<&str> {
        self.common().other_rootfs_name()
    }

    /// Label of the rootfs the bootloader will use next, from its variables
    pub fn get_next_boot_rootfs_name(&self) -> Result<Option<String>, Error> {
        self.common().next_boot_rootfs_name()
    }

    /// Flag the running rootfs as good
    pub fn mark_current_boot_successful(&self) -> Result<(), Error> {
        match &self {
            Bootloader::UBoot(u) => u.mark_current_boot_successful(),
            Bootloader::Grub(g) => g.mark_current_boot_successful(),
        }
    }

    /// Paths that must be visible inside the other rootfs when it is mounted writable
    pub fn additional_bind_mounts(&self) -> &'static [&'static str] {
        match &self {
            Bootloader::UBoot(_) => uboot::BIND_MOUNTS,
            Bootloader::Grub(_) => grub::BIND_MOUNTS,
        }
    }
}

/// Returns true if the next boot will use the other rootfs
///
/// Any failure to read the variables is reported as `false`.
pub fn is_next_boot_other(bootloader: &Bootloader) -> bool {
    let Ok(Some(mode)) = bootloader.get_boot_var(BOOTMODE_VAR) else {
        return false;
    };
    if mode != BOOTMODE_TRY {
        return false;
    }
    let Ok(Some(next)) = bootloader.get_next_boot_rootfs_name() else {
        return false;
    };
    bootloader.get_other_rootfs_name() == Some(next.as_str())
}
