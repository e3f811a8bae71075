// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Behaviour shared by every bootloader family

use std::{
    fs::{self, create_dir_all},
    io,
    path::{Component, Path, PathBuf},
};

use crate::{
    bootvars::{BOOTMODE_SUCCESS, BOOTMODE_TRY, BOOTMODE_VAR, ROOTFS_VAR},
    config_file::Change,
    file_utils::{changed_files, copy_atomic_vfat, copy_tree, remove_depth_first},
    partition::Slot,
    BootMode, BootVariableStore, Configuration, ConfigFile, HardwareSpec,
};

use super::Error;

/// Subdirectory of a slot's boot directory holding device tree blobs
const DTB_DIR: &str = "dtbs";

/// Each rootfs slot has a boot directory named after its label
#[derive(Debug)]
pub struct Common {
    /// i.e. `/boot/uboot`
    boot_dir: PathBuf,

    vars: BootVariableStore,

    current_rootfs: String,
    other_rootfs: Option<String>,

    cache_dir: PathBuf,
    flash_assets_dir: PathBuf,
}

impl Common {
    pub(super) fn new(
        config: &Configuration,
        boot_dir: &str,
        env: ConfigFile,
        current: &Slot,
        other: Option<&Slot>,
    ) -> Self {
        Self {
            boot_dir: config.path(boot_dir),
            vars: BootVariableStore::new(env),
            current_rootfs: current.label.clone(),
            other_rootfs: other.map(|o| o.label.clone()),
            cache_dir: config.cache_dir(),
            flash_assets_dir: config.flash_assets_dir(),
        }
    }

    pub fn vars(&self) -> &BootVariableStore {
        &self.vars
    }

    pub fn rootfs_name(&self) -> &str {
        &self.current_rootfs
    }

    pub fn other_rootfs_name(&self) -> Option<&str> {
        self.other_rootfs.as_deref()
    }

    /// Boot directory of the running slot
    pub fn current_boot_path(&self) -> PathBuf {
        self.boot_dir.join(&self.current_rootfs)
    }

    /// Boot directory of the other slot
    pub fn other_boot_path(&self) -> Option<PathBuf> {
        self.other_rootfs.as_ref().map(|o| self.boot_dir.join(o))
    }

    pub(super) fn next_boot_rootfs_name(&self) -> Result<Option<String>, Error> {
        Ok(self.vars.get(ROOTFS_VAR)?)
    }

    /// Point the bootloader at the other slot in try mode, as one atomic write
    ///
    /// The environment lives on a writable partition and may have been
    /// removed by an admin, so it is recreated when missing.
    pub(super) fn toggle_rootfs(&self) -> Result<(), Error> {
        let other = self.other_rootfs.as_deref().ok_or(Error::NoDualPartition)?;
        self.vars
            .set_all(&[Change::new(ROOTFS_VAR, other), Change::new(BOOTMODE_VAR, BOOTMODE_TRY)])?;
        log::info!("Next boot will try rootfs {other}");
        Ok(())
    }

    /// Confirm the running slot, plus any family specific resets
    ///
    /// Variables are only written while trying, or when a family reset is
    /// still raised. Outside try mode this is a no-op. The stamp file is
    /// removed on a best-effort basis.
    pub(super) fn mark_current_boot_successful(
        &self,
        extra: &[Change],
        stamp: Option<&Path>,
    ) -> Result<(), Error> {
        let mut changes = vec![Change::new(BOOTMODE_VAR, BOOTMODE_SUCCESS)];
        changes.extend_from_slice(extra);

        let trying = matches!(self.vars.mode(), Ok(BootMode::Trying));
        let raised = extra
            .iter()
            .any(|c| matches!(self.vars.get(c.name), Ok(Some(v)) if v != c.value));
        if trying || raised {
            self.vars.set_all(&changes)?;
            log::info!("Marked rootfs {} as booted successfully", self.current_rootfs);
        } else {
            log::debug!("rootfs {} already confirmed", self.current_rootfs);
        }

        if let Some(stamp) = stamp {
            match fs::remove_file(stamp) {
                Ok(_) => log::debug!("Removed stamp file {}", stamp.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove stamp file {}: {e}", stamp.display()),
            }
        }

        Ok(())
    }

    /// Replace the other slot's boot directory with a copy of ours
    ///
    /// All files there are owned by us, so always start from scratch.
    pub(super) fn sync_boot_files(&self) -> Result<(), Error> {
        let Some(dest) = self.other_boot_path() else {
            log::debug!("single rootfs system, no boot files to sync");
            return Ok(());
        };
        let source = self.current_boot_path();

        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        copy_tree(&source, &dest)?;
        log::info!("Synced boot files {} -> {}", source.display(), dest.display());

        Ok(())
    }

    /// Validate the hardware spec against this device, then install its assets
    ///
    /// Validation happens before anything is copied. Staging paths are only
    /// removed once every asset landed.
    pub(super) fn handle_assets(&self, name: &'static str, hardware: &HardwareSpec) -> Result<(), Error> {
        if hardware.bootloader != name {
            return Err(Error::BootloaderMismatch {
                found: name,
                required: hardware.bootloader.clone(),
            });
        }
        if hardware.requires_dual_partitions() && self.other_rootfs.is_none() {
            return Err(Error::DualPartitionRequired);
        }
        for asset in [&hardware.kernel, &hardware.initrd, &hardware.dtb_dir]
            .into_iter()
            .flatten()
        {
            check_asset_path(asset)?;
        }

        // Single rootfs systems are updated in place
        let dest = self.other_boot_path().unwrap_or_else(|| self.current_boot_path());
        create_dir_all(&dest)?;

        let mut changeset = vec![];
        let mut consumed = vec![];

        for file in [&hardware.kernel, &hardware.initrd].into_iter().flatten() {
            let source = self.cache_dir.join(file);
            if !source.exists() {
                log::warn!("hardware spec names missing asset {}", source.display());
                continue;
            }
            let file_name = source
                .file_name()
                .ok_or_else(|| Error::MissingFile(source.clone()))?;
            changeset.push((source.clone(), dest.join(file_name)));
            consumed.extend(self.staging_file(&source));
        }

        if let Some(dtbs) = hardware.dtb_dir.as_ref() {
            let source = self.cache_dir.join(dtbs);
            if source.is_dir() {
                let dtb_dest = dest.join(DTB_DIR);
                create_dir_all(&dtb_dest)?;
                let pattern = source.join("*");
                for entry in glob::glob(&pattern.to_string_lossy())? {
                    let path = entry?;
                    if let Some(file_name) = path.file_name().filter(|_| path.is_file()) {
                        changeset.push((path.clone(), dtb_dest.join(file_name)));
                    }
                }
                consumed.extend(self.staging_dir(&source));
            }
        }

        for (source, dest) in changed_files(&changeset) {
            copy_atomic_vfat(source, dest)?;
        }

        // Flash tool assets are not part of the manifest, drop them
        if self.flash_assets_dir.exists() {
            consumed.push(self.flash_assets_dir.clone());
        }

        remove_depth_first(consumed)?;
        Ok(())
    }

    /// Staging directory holding a consumed file, or the file itself at the cache root
    fn staging_file(&self, file: &Path) -> Option<PathBuf> {
        match file.parent() {
            Some(parent) if parent != self.cache_dir && parent.starts_with(&self.cache_dir) => {
                Some(parent.to_path_buf())
            }
            _ if file.starts_with(&self.cache_dir) => Some(file.to_path_buf()),
            _ => None,
        }
    }

    /// Consumed staging directory, never the cache itself
    fn staging_dir(&self, dir: &Path) -> Option<PathBuf> {
        if dir != self.cache_dir && dir.starts_with(&self.cache_dir) {
            Some(dir.to_path_buf())
        } else {
            None
        }
    }
}

/// Manifest paths are relative and must stay below the cache directory
fn check_asset_path(path: &Path) -> Result<(), Error> {
    let contained = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if contained {
        Ok(())
    } else {
        Err(Error::InvalidAssetPath(path.to_path_buf()))
    }
}
