// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub mod bootloader;
pub use bootloader::Bootloader;

mod bootvars;
pub use bootvars::{BootMode, BootVariableStore};

pub mod config_file;
pub use config_file::ConfigFile;

pub mod file_utils;

mod hardware;
pub use hardware::HardwareSpec;

pub mod image;

mod orchestrator;
pub use orchestrator::{Orchestrator, Progress, State, UpdateTarget};

pub mod partition;
pub use partition::{MountMode, Mounter, Partition, Slot, SystemMounter};

pub mod service;

/// Re-export the topology APIs
pub use topology::disk;

/// Core error type for abupdate
#[derive(Debug, Error)]
pub enum Error {
    #[error("bootloader: {0}")]
    Bootloader(#[from] bootloader::Error),

    #[error("c stdlib: {0}")]
    C(#[from] nix::errno::Errno),

    #[error("generic i/o error: {0}")]
    IO(#[from] std::io::Error),

    #[error("topology scan: {0}")]
    Topology(#[from] topology::disk::Error),

    #[error("hardware spec: {0}")]
    HardwareSpec(#[from] serde_yaml::Error),

    #[error("image information: {0}")]
    Image(#[from] image::Error),

    #[error("no dual root partition")]
    NoDualPartition,

    #[error("update service: {0}")]
    Service(String),

    #[error("{phase} failed: {reason}")]
    UpdateFailed { phase: State, reason: String },

    #[error("timed out after {} seconds waiting for the update service to respond", .0.as_secs())]
    Timeout(Duration),

    #[error("update service notification channel closed")]
    Disconnected,

    #[error("could not find latest installed partition")]
    NoLatestPartition,

    #[error("found latest installed version {found:?} (expected {expected:?})")]
    VerificationFailed { expected: String, found: String },

    #[error("failed to interact with filesystem properly")]
    InvalidFilesystem,
}

impl Error {
    /// Device and update disagree, or the switch had no effect. Never retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Bootloader(e) => e.is_fatal(),
            Error::NoLatestPartition | Error::VerificationFailed { .. } => true,
            _ => false,
        }
    }
}

/// Core configuration for A/B update management
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Root of all operations, every absolute path is resolved below it
    pub root: PathBuf,

    /// Staging area for downloaded assets (relative to `root`)
    pub cache_dir: PathBuf,

    /// Where the other root filesystem is mounted (relative to `root`)
    pub mount_target: PathBuf,

    /// Filesystem type of the root filesystem slots
    pub filesystem: String,

    /// How long to wait for the update service to signal progress
    pub timeout: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            root: "/".into(),
            cache_dir: "/writable/cache".into(),
            mount_target: "/writable/cache/system".into(),
            filesystem: "ext4".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Configuration {
    /// Configuration operating on an alternative root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Resolve an absolute system path below [`Configuration::root`]
    pub fn path(&self, path: impl AsRef<std::path::Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Absolute staging directory
    pub fn cache_dir(&self) -> PathBuf {
        self.path(&self.cache_dir)
    }

    /// Absolute mountpoint of the other slot
    pub fn mount_target(&self) -> PathBuf {
        self.path(&self.mount_target)
    }

    /// Location of the hardware manifest shipped with an update
    pub fn hardware_spec_file(&self) -> PathBuf {
        self.cache_dir().join("hardware.yaml")
    }

    /// Assets for flashing tools, not described by the hardware manifest
    pub fn flash_assets_dir(&self) -> PathBuf {
        self.cache_dir().join("flashtool-assets")
    }

    /// Block device table saved by [`partition::cache_lsblk`]
    pub fn lsblk_cache_file(&self) -> PathBuf {
        self.cache_dir().join("lsblk.cache")
    }
}
