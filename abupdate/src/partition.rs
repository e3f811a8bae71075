// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Root filesystem slots and scoped access to the inactive one

use std::{
    fmt,
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
};

use nix::mount::{mount, umount, MsFlags};
use topology::disk::{
    builder::{self, Builder},
    lsblk::Device,
    Probe,
};

use crate::{
    bootloader::{self, Bootloader},
    image::ImageInfo,
    Configuration, ConfigFile, Error, HardwareSpec,
};

/// How to mount the other slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// Mount primitives, injected so tests never touch the real mount table
pub trait Mounter: fmt::Debug {
    fn mount(&self, source: &Path, target: &Path, filesystem: &str, mode: MountMode) -> Result<(), Error>;

    fn bind(&self, source: &Path, target: &Path) -> Result<(), Error>;

    fn umount(&self, target: &Path) -> Result<(), Error>;
}

/// mount(2) backed [`Mounter`]
#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, source: &Path, target: &Path, filesystem: &str, mode: MountMode) -> Result<(), Error> {
        let flags = match mode {
            MountMode::ReadOnly => MsFlags::MS_RDONLY,
            MountMode::ReadWrite => MsFlags::empty(),
        };
        let options: Option<&str> = None;
        mount(Some(source), target, Some(filesystem), flags, options)?;
        log::info!("Mounted {} at {} ({mode:?})", source.display(), target.display());
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<(), Error> {
        let options: Option<&str> = None;
        mount(Some(source), target, options, MsFlags::MS_BIND, options)?;
        log::info!("Bind mounted {} at {}", source.display(), target.display());
        Ok(())
    }

    fn umount(&self, target: &Path) -> Result<(), Error> {
        umount(target)?;
        Ok(())
    }
}

/// Encapsulated mountpoint to ensure auto-unmount (Scoped)
struct ScopedMount<'a> {
    mounter: &'a dyn Mounter,
    point: PathBuf,
    mounted: bool,
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        match self.mounter.umount(&self.point) {
            Ok(_) => log::info!("Unmounted {}", self.point.display()),
            Err(err) => log::error!("Failed to umount {}: {}", self.point.display(), err),
        }
    }
}

/// Nested mounts, released innermost first
struct MountStack<'a>(Vec<ScopedMount<'a>>);

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        while let Some(mount) = self.0.pop() {
            drop(mount);
        }
    }
}

/// One of the two root filesystem slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Last character of the filesystem label, i.e. `a` for `system-a`
    pub label: String,

    /// Block device node
    pub device: PathBuf,

    /// Where the slot is mounted, if anywhere
    pub mountpoint: Option<PathBuf>,
}

impl Slot {
    fn from_device(probe: &Probe, device: &Device) -> Option<Self> {
        let label = device.label.as_deref()?.chars().last()?;
        Some(Self {
            label: label.to_string(),
            device: probe.device_path(device),
            mountpoint: device.mountpoint.as_deref().map(PathBuf::from),
        })
    }
}

/// Encapsulate the A/B partition layout of the running system
#[derive(Debug)]
pub struct Partition {
    config: Configuration,
    current: Slot,
    other: Option<Slot>,
    mounter: Box<dyn Mounter>,
}

impl Partition {
    /// Resolve both slots from the probed block devices
    pub fn new(config: Configuration, probe: &Probe, mounter: Box<dyn Mounter>) -> Result<Self, Error> {
        let root = probe.root_partition()?;
        let current = Slot::from_device(probe, &root).ok_or(topology::disk::Error::NoRootPartition)?;
        let other = probe
            .other_root_partition()
            .and_then(|d| Slot::from_device(probe, &d));

        log::debug!("current rootfs: {current:?}");
        match other.as_ref() {
            Some(other) => log::debug!("other rootfs: {other:?}"),
            None => log::debug!("single rootfs system"),
        }

        Ok(Self {
            config,
            current,
            other,
            mounter,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The running slot
    pub fn root_partition(&self) -> &Slot {
        &self.current
    }

    /// The inactive slot, `None` on single partition systems
    pub fn other_root_partition(&self) -> Option<&Slot> {
        self.other.as_ref()
    }

    pub fn dual_root_partitions(&self) -> bool {
        self.other.is_some()
    }

    /// The installed bootloader, driving our slots
    pub fn bootloader(&self) -> Result<Bootloader, bootloader::Error> {
        Bootloader::new(&self.config, &self.current, self.other.as_ref())
    }

    /// The hardware manifest staged by an update, if any
    pub fn hardware_spec(&self) -> Result<Option<HardwareSpec>, Error> {
        HardwareSpec::load(self.config.hardware_spec_file())
    }

    /// Mount the other slot, run `action` on its mountpoint, unmount again
    ///
    /// Writable mounts also receive the bootloader's additional bind mounts.
    /// Every mount is released before returning, whatever `action` does.
    /// Must not be nested.
    pub fn run_with_other<T>(&self, mode: MountMode, action: impl FnOnce(&Path) -> Result<T, Error>) -> Result<T, Error> {
        let other = self.other.as_ref().ok_or(Error::NoDualPartition)?;
        let target = self.config.mount_target();
        if !target.exists() {
            create_dir_all(&target)?;
        }

        let mut mounts = MountStack(vec![]);
        self.mounter
            .mount(&other.device, &target, &self.config.filesystem, mode)?;
        mounts.0.push(ScopedMount {
            mounter: self.mounter.as_ref(),
            point: target.clone(),
            mounted: true,
        });

        if mode == MountMode::ReadWrite {
            let binds = match self.bootloader() {
                Ok(loader) => loader.additional_bind_mounts(),
                Err(e) => {
                    log::debug!("no bind mounts: {e}");
                    &[]
                }
            };
            for bind in binds {
                let source = self.config.path(bind);
                let point = target.join(bind.trim_start_matches('/'));
                if !point.exists() {
                    create_dir_all(&point)?;
                }
                self.mounter.bind(&source, &point)?;
                mounts.0.push(ScopedMount {
                    mounter: self.mounter.as_ref(),
                    point,
                    mounted: true,
                });
            }
        }

        action(&target)
    }

    /// Image carried by the running slot
    pub fn current_image(&self) -> Result<Option<ImageInfo>, Error> {
        Ok(ImageInfo::load(&self.config.root, true)?)
    }

    /// Image carried by the other slot, `None` without one
    pub fn other_image(&self) -> Result<Option<ImageInfo>, Error> {
        match self.run_with_other(MountMode::ReadOnly, |root| Ok(ImageInfo::load(root, false)?)) {
            Err(Error::NoDualPartition) => Ok(None),
            res => res,
        }
    }

    /// Returns true if the next boot will use the other slot
    pub fn next_boot_is_other(&self) -> bool {
        match self.bootloader() {
            Ok(loader) => bootloader::is_next_boot_other(&loader),
            Err(e) => {
                log::debug!("cannot query next boot: {e}");
                false
            }
        }
    }

    /// Mark the running slot as good
    pub fn mark_boot_successful(&self) -> Result<(), Error> {
        Ok(self.bootloader()?.mark_current_boot_successful()?)
    }

    /// Ensure the other slot always has something bootable
    pub fn sync_bootloader_files(&self) -> Result<(), Error> {
        Ok(self.bootloader()?.sync_boot_files()?)
    }

    /// Install staged hardware assets, then boot the other slot next time
    pub fn update_bootloader(&self) -> Result<(), Error> {
        let loader = self.bootloader()?;
        if let Some(hardware) = self.hardware_spec()? {
            loader.handle_assets(&hardware)?;
        }
        if self.dual_root_partitions() {
            loader.toggle_rootfs()?;
        } else {
            log::info!("single rootfs system updated in place, nothing to toggle");
        }
        Ok(())
    }
}

/// Save the block device table so later runs need not call `lsblk`
pub fn cache_lsblk(config: &Configuration, builder: &Builder<'_>) -> Result<PathBuf, Error> {
    let output = builder.output()?;
    let lines = output.lines().map(str::to_string).collect::<Vec<_>>();
    let file = ConfigFile::new(config.lsblk_cache_file());
    file.atomic_write(&lines)?;
    log::info!("Cached {} block devices in {}", lines.len(), file.path().display());
    Ok(file.path().to_path_buf())
}

/// Block device table from the output saved by [`cache_lsblk`]
pub fn cached_block_devices(config: &Configuration) -> Result<Probe, Error> {
    let path = config.lsblk_cache_file();
    log::debug!("Using cached block devices from {}", path.display());
    let output = fs::read_to_string(path)?;
    Ok(builder::new().with_lsblk_output(output).build()?)
}
