// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Boot control variables stored in a `name=value` environment file

use std::{fmt, io};

use crate::config_file::{line_name, Change, ConfigFile};

/// Selects which rootfs slot to boot from
pub const ROOTFS_VAR: &str = "snappy_ab";

/// Either [`BOOTMODE_TRY`] or [`BOOTMODE_SUCCESS`]
pub const BOOTMODE_VAR: &str = "snappy_mode";

/// Boot the selected slot once, fall back if it never confirms
pub const BOOTMODE_TRY: &str = "try";

/// The selected slot booted successfully
pub const BOOTMODE_SUCCESS: &str = "default";

/// Semantic view of [`BOOTMODE_VAR`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// No mode recorded, or a value we don't know about
    NotTrying,

    /// A switch to the selected slot is pending confirmation
    Trying,

    /// The selected slot is known good
    Confirmed,
}

impl BootMode {
    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(BOOTMODE_TRY) => BootMode::Trying,
            Some(BOOTMODE_SUCCESS) => BootMode::Confirmed,
            _ => BootMode::NotTrying,
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::NotTrying => f.write_str("not-trying"),
            BootMode::Trying => f.write_str("trying"),
            BootMode::Confirmed => f.write_str("confirmed"),
        }
    }
}

/// Typed access to the bootloader's variable file
#[derive(Debug, Clone)]
pub struct BootVariableStore {
    file: ConfigFile,
}

impl BootVariableStore {
    pub fn new(file: ConfigFile) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &ConfigFile {
        &self.file
    }

    /// All raw `name=value` entries, skipping blank lines, comments and junk
    pub fn get_all(&self) -> io::Result<Vec<String>> {
        Ok(self
            .file
            .read_lines()?
            .into_iter()
            .filter(|l| !l.trim().is_empty())
            .filter(|l| !l.starts_with('#'))
            .filter(|l| l.contains('='))
            .collect())
    }

    /// Value of `name`, `None` when it is not set
    pub fn get(&self, name: &str) -> io::Result<Option<String>> {
        Ok(self
            .get_all()?
            .into_iter()
            .find(|l| line_name(l) == Some(name))
            .and_then(|l| l.split_once('=').map(|(_, v)| v.to_string())))
    }

    /// Set a single variable, creating the file if needed
    pub fn set(&self, name: &str, value: &str) -> io::Result<()> {
        self.set_all(&[Change::new(name, value)])
    }

    /// Set several variables as one atomic change
    pub fn set_all(&self, changes: &[Change]) -> io::Result<()> {
        self.file.apply_changes(changes)
    }

    /// Remove `name`, returning the value it had
    pub fn clear(&self, name: &str) -> io::Result<Option<String>> {
        self.file.remove(name)
    }

    /// Current [`BootMode`]
    pub fn mode(&self) -> io::Result<BootMode> {
        Ok(BootMode::from_value(self.get(BOOTMODE_VAR)?.as_deref()))
    }
}
