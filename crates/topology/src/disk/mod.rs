// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk probe/query APIs

use thiserror::Error;

pub mod builder;
pub mod lsblk;
pub mod probe;

pub use probe::Probe;

#[derive(Debug, Error)]
pub enum Error {
    #[error("from io: {0}")]
    IO(#[from] std::io::Error),

    #[error("lsblk failed: {0}")]
    Command(String),

    #[error("lsblk output is not valid utf8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("no root filesystem partition mounted at /")]
    NoRootPartition,
}
