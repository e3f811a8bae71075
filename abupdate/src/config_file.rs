// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Atomic editing of `name=value` text files
//!
//! Bootloader environments are plain text files which an administrator may
//! edit by hand. All edits made here preserve comments, blank lines and the
//! ordering of untouched lines, and every rewrite lands on disk through a
//! single rename so a reader never observes a partially written file.

use std::{
    ffi::OsString,
    fs::{self, create_dir_all, File},
    io::{self, BufRead, BufReader, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

/// A single `name=value` assignment to apply to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> Change<'a> {
    pub fn new(name: &'a str, value: &'a str) -> Self {
        Self { name, value }
    }
}

/// Handle to a `name=value` text file on disk
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,

    /// Fixed size environment block layout, if any
    block: Option<Block>,
}

/// Fixed size environment block: a header line, assignments, then `#` padding
#[derive(Debug, Clone, Copy)]
struct Block {
    header: &'static str,
    size: usize,
}

/// Return the name of a `name=value` line, if it is one
pub fn line_name(line: &str) -> Option<&str> {
    line.split_once('=').map(|(name, _)| name)
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block: None,
        }
    }

    /// Treat the file as a fixed size block (i.e. `grubenv`)
    pub fn with_block(self, header: &'static str, size: usize) -> Self {
        Self {
            block: Some(Block { header, size }),
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read all lines of the file, failing with `NotFound` if it is absent
    ///
    /// Block padding is stripped so it never reaches the caller.
    pub fn read_lines(&self) -> io::Result<Vec<String>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        if self.block.is_some() {
            while lines.last().is_some_and(|l| !l.is_empty() && l.chars().all(|c| c == '#')) {
                lines.pop();
            }
        }
        Ok(lines)
    }

    /// Sibling path used to stage a rewrite
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("config"));
        name.push(".NEW");
        self.path.with_file_name(name)
    }

    /// Serialise lines, applying block padding if required
    fn render(&self, lines: &[String]) -> io::Result<String> {
        let mut out = lines.iter().fold(String::new(), |mut acc, line| {
            acc.push_str(line);
            acc.push('\n');
            acc
        });
        if let Some(Block { size, .. }) = self.block {
            if out.len() > size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} exceeds the {size} byte environment block ({} bytes)",
                        self.path.display(),
                        out.len()
                    ),
                ));
            }
            out.push_str(&"#".repeat(size - out.len()));
        }
        Ok(out)
    }

    /// Replace the file contents with `lines`
    ///
    /// The data is written to a sibling `.NEW` file and renamed into place.
    /// A crash before the rename leaves the original file untouched.
    pub fn atomic_write(&self, lines: &[String]) -> io::Result<()> {
        let contents = self.render(lines)?;
        let staging = self.staging_path();

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                create_dir_all(parent)?;
            }
        }

        let mut output = File::options()
            .truncate(true)
            .write(true)
            .create(true)
            .open(&staging)?;
        output.write_all(contents.as_bytes())?;
        nix::unistd::fsync(output.as_raw_fd()).map_err(io::Error::from)?;

        fs::rename(&staging, &self.path)?;
        log::trace!("atomically rewrote {}", self.path.display());

        Ok(())
    }

    /// Apply a change-set in a single atomic rewrite
    ///
    /// Existing assignments are rewritten in place, later duplicates of a
    /// changed name are dropped, and names not present yet are appended in
    /// the order given. Everything else passes through untouched. A missing
    /// file is created.
    pub fn apply_changes(&self, changes: &[Change]) -> io::Result<()> {
        let lines = match self.read_lines() {
            Ok(lines) => lines,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("{} missing, recreating it", self.path.display());
                self.block.map(|b| vec![b.header.to_string()]).unwrap_or_default()
            }
            Err(e) => return Err(e),
        };

        let mut seen = vec![];
        let mut updated = Vec::with_capacity(lines.len() + changes.len());

        for line in lines {
            let change = line_name(&line).and_then(|name| changes.iter().find(|c| c.name == name));
            match change {
                Some(change) if seen.contains(&change.name) => {
                    log::debug!("dropping duplicate assignment: {line}");
                }
                Some(change) => {
                    seen.push(change.name);
                    updated.push(format!("{}={}", change.name, change.value));
                }
                None => updated.push(line),
            }
        }

        for change in changes {
            if !seen.contains(&change.name) {
                seen.push(change.name);
                updated.push(format!("{}={}", change.name, change.value));
            }
        }

        log::trace!("applying {changes:?} to {}", self.path.display());
        self.atomic_write(&updated)
    }

    /// Remove every assignment of `name`, returning the value it had
    ///
    /// The file is left untouched when `name` is not assigned.
    pub fn remove(&self, name: &str) -> io::Result<Option<String>> {
        let (matching, kept): (Vec<_>, Vec<_>) = self
            .read_lines()?
            .into_iter()
            .partition(|line| line_name(line) == Some(name));

        let Some(first) = matching.first() else {
            return Ok(None);
        };
        let previous = first.split_once('=').map(|(_, value)| value.to_string());

        self.atomic_write(&kept)?;
        Ok(previous)
    }
}
