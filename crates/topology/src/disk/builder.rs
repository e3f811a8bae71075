// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Builder API for constructing the Probe
use std::{path::PathBuf, process::Command};

use crate::disk::probe::Probe;

use super::lsblk::Table;

/// Builder pattern for a Probe
pub struct Builder<'a> {
    devfs: &'a str,
    lsblk: &'a str,
    output: Option<String>,
}

/// Generate default builder
pub fn new<'a>() -> Builder<'a> {
    Builder {
        devfs: "/dev",
        lsblk: "/bin/lsblk",
        output: None,
    }
}

impl<'a> Default for Builder<'a> {
    fn default() -> Self {
        self::new()
    }
}

impl<'a> Builder<'a> {
    /// devfs directory
    pub fn with_devfs(self, devfs: &'a str) -> Self {
        Self { devfs, ..self }
    }

    /// Alternative `lsblk` binary
    pub fn with_lsblk(self, lsblk: &'a str) -> Self {
        Self { lsblk, ..self }
    }

    /// Use previously captured `lsblk --pairs` output instead of running the tool
    pub fn with_lsblk_output(self, output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..self
        }
    }

    /// Raw `lsblk --pairs` output the Probe would be built from
    pub fn output(&self) -> Result<String, super::Error> {
        match &self.output {
            Some(output) => Ok(output.clone()),
            None => run_lsblk(self.lsblk),
        }
    }

    /// Return a newly built Probe
    pub fn build(self) -> Result<Probe, super::Error> {
        let data = self.output()?;
        let table = Table::new(data);
        log::trace!("lsblk: {:?}", table.iter().collect::<Vec<_>>());

        Ok(Probe {
            devfs: PathBuf::from(self.devfs),
            table,
        })
    }
}

/// Query the kernel's block device table
fn run_lsblk(lsblk: &str) -> Result<String, super::Error> {
    let output = Command::new(lsblk)
        .args(["--ascii", "--output=NAME,LABEL,PKNAME,MOUNTPOINT", "--pairs"])
        .output()?;
    if !output.status.success() {
        return Err(super::Error::Command(format!(
            "{lsblk} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8(output.stdout)?)
}
