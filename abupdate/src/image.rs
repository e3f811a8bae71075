// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! System image metadata of a root filesystem slot
//!
//! Each slot records the image it carries in `etc/system-image/channel.ini`:
//!
//! ```ini
//! [service]
//! build_number = 42
//! version_detail = ubuntu=20150415,device=20150402,custom=1
//! channel = ubuntu-core/stable
//! ```

use std::{cmp::Ordering, collections::HashMap, fs, io, path::Path, str::FromStr};

use thiserror::Error;

/// Image description of a slot, relative to its root
pub const CHANNEL_CONFIG: &str = "etc/system-image/channel.ini";

/// Update client configuration of a slot, relative to its root
pub const CLIENT_CONFIG: &str = "etc/system-image/client.ini";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing key: {0}")]
    MissingKey(&'static str),

    #[error("i/o error: {0}")]
    IO(#[from] io::Error),
}

/// What a slot says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// The build number, compared against update targets
    pub version: String,

    pub version_details: Option<String>,

    pub channel: Option<String>,

    /// Is this the running slot?
    pub active: bool,
}

impl FromStr for ImageInfo {
    type Err = self::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut section = "";
        let mut map = HashMap::new();
        for line in s.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim();
                continue;
            }
            if section != "service" {
                continue;
            }
            // configparser accepts both delimiters, the first one wins
            if let Some(i) = line.find(['=', ':']) {
                map.insert(line[..i].trim(), line[i + 1..].trim());
            }
        }

        Ok(Self {
            version: map
                .get("build_number")
                .ok_or(Error::MissingKey("build_number"))?
                .to_string(),
            version_details: map.get("version_detail").map(|s| s.to_string()),
            channel: map.get("channel").map(|s| s.to_string()),
            active: false,
        })
    }
}

impl ImageInfo {
    /// Read the image description below `root`, `None` if the slot has none
    pub fn load(root: impl AsRef<Path>, active: bool) -> Result<Option<Self>, self::Error> {
        let path = root.as_ref().join(CHANNEL_CONFIG);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No image description at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let info = Self::from_str(&text)?;
        Ok(Some(Self { active, ..info }))
    }
}

/// Order two image versions: numerically for build numbers, lexically otherwise
pub fn version_compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use std::{cmp::Ordering, fs, str::FromStr};

    use super::{version_compare, ImageInfo, CHANNEL_CONFIG};

    #[test]
    fn parse_channel_ini() {
        let info = ImageInfo::from_str(
            "[service]\nbase: system-image.ubuntu.com\nbuild_number: 187\nchannel: ubuntu-core/devel\nversion_detail: ubuntu=20150224\n\n[gpg]\nbuild_number: 1\n",
        )
        .expect("valid");
        assert_eq!(info.version, "187");
        assert_eq!(info.channel.as_deref(), Some("ubuntu-core/devel"));
        assert_eq!(info.version_details.as_deref(), Some("ubuntu=20150224"));
        assert!(!info.active);

        assert!(ImageInfo::from_str("[gpg]\nbuild_number=3\n").is_err());
    }

    #[test]
    fn load_from_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(ImageInfo::load(dir.path(), true).expect("absent").is_none());

        let path = dir.path().join(CHANNEL_CONFIG);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[service]\nbuild_number = 12\n").unwrap();
        let info = ImageInfo::load(dir.path(), true).expect("load").expect("present");
        assert_eq!(info.version, "12");
        assert!(info.active);
    }

    #[test]
    fn compare_versions() {
        assert_eq!(version_compare("9", "10"), Ordering::Less);
        assert_eq!(version_compare("10", "10"), Ordering::Equal);
        assert_eq!(version_compare("2015.1", "2015.2"), Ordering::Less);
    }
}
