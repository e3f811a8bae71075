// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! File utilities shared between the abupdate APIs

use std::{
    collections::BTreeSet,
    fs::{self, create_dir_all, File},
    io,
    os::{fd::AsRawFd, unix::fs::MetadataExt},
    path::{Path, PathBuf},
};

use crate::Error;

/// Compare two files with blake3 to see if they differ
fn files_identical(hasher: &mut blake3::Hasher, a: &Path, b: &Path) -> Result<bool, Error> {
    let fi_a = File::open(a)?;
    let fi_b = File::open(b)?;
    let fi_a_m = fi_a.metadata()?;
    let fi_b_m = fi_b.metadata()?;
    if fi_a_m.size() != fi_b_m.size() || fi_a_m.file_type() != fi_b_m.file_type() {
        Ok(false)
    } else {
        hasher.update_mmap_rayon(a)?;
        let result_a = hasher.finalize();
        hasher.reset();

        hasher.update_mmap_rayon(b)?;
        let result_b = hasher.finalize();
        hasher.reset();

        Ok(result_a == result_b)
    }
}

/// Find out which files in the set changed
///
/// Given a slice containing tuples of pathbufs, return an
/// allocated set of cloned pathbuf tuples (pairs) known to
/// differ.
///
/// The first element in the tuple should be the source path, and the
/// right hand side should contain the destination path.
pub fn changed_files(files: &[(PathBuf, PathBuf)]) -> Vec<(&PathBuf, &PathBuf)> {
    let mut hasher = blake3::Hasher::new();

    files
        .iter()
        .filter_map(|(source, dest)| match files_identical(&mut hasher, source, dest) {
            Ok(same) => {
                if same {
                    None
                } else {
                    Some((source, dest))
                }
            }
            Err(_) => Some((source, dest)),
        })
        .collect::<Vec<_>>()
}

/// Copy source file to dest file, handling vfat oddities.
///
/// Boot partitions on u-boot devices are usually vfat, so we always set a
/// temporary file name up, then delete the target file, and finally rename
/// into place. This is to prevent various block corruption issues with vfat.
pub fn copy_atomic_vfat(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let source = source.as_ref();
    let dest = dest.as_ref();

    log::trace!("copy_atomic_vfat: {}", dest.display());

    // Staging path
    let dest_temp = dest.with_extension("TmpWrite");
    let dest_exists = dest.exists();

    // Ensure leading path structure exists
    let dir_leading = dest.parent().ok_or(Error::InvalidFilesystem)?;
    if !dir_leading.exists() {
        create_dir_all(dir_leading)?;
    }

    // open source/dest
    let mut output = File::options()
        .truncate(true)
        .write(true)
        .create(true)
        .open(&dest_temp)?;
    let mut input = File::open(source)?;

    let output_fd = output.as_raw_fd();

    // Copy *contents* only
    io::copy(&mut input, &mut output)?;
    nix::unistd::syncfs(output_fd)?;

    // Remove original destination file
    if dest_exists {
        fs::remove_file(dest)?;
        nix::unistd::syncfs(output_fd)?;
    }

    // Rename into final location
    fs::rename(dest_temp, dest)?;
    nix::unistd::syncfs(output_fd)?;

    log::info!("Updated boot file: {}", dest.display());

    Ok(())
}

/// Recursively copy `source` to `dest`, keeping permissions and symlinks
pub fn copy_tree(source: &Path, dest: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let meta = fs::symlink_metadata(source)?;
    let kind = meta.file_type();

    if kind.is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(source)?, dest)?;
    } else if kind.is_dir() {
        create_dir_all(dest)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
        fs::set_permissions(dest, meta.permissions())?;
    } else {
        fs::copy(source, dest)?;
    }

    Ok(())
}

/// Remove each directory tree, deepest paths first
///
/// Reverse lexical order guarantees `/a/b` goes before `/a`. Paths that
/// vanished already are skipped.
pub fn remove_depth_first(
    paths: impl IntoIterator<Item = PathBuf>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let paths = paths.into_iter().collect::<BTreeSet<_>>();
    for path in paths.iter().rev() {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
            Ok(_) => fs::remove_file(path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
        log::debug!("Removed staging path: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::{changed_files, copy_atomic_vfat, copy_tree, remove_depth_first};

    #[test]
    fn changed_detection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (a, b, c) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
        fs::write(&a, "kernel").unwrap();
        fs::write(&b, "kernel").unwrap();
        fs::write(&c, "kernel-new").unwrap();

        let pairs = vec![(a.clone(), b.clone()), (c.clone(), b.clone()), (a.clone(), dir.path().join("missing"))];
        let changed = changed_files(&pairs);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].0, &c);
    }

    #[test]
    fn atomic_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("vmlinuz");
        let dest = dir.path().join("boot").join("b").join("vmlinuz");
        fs::write(&source, "new kernel").unwrap();

        copy_atomic_vfat(&source, &dest).expect("copy");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new kernel");

        fs::write(&source, "newer kernel").unwrap();
        copy_atomic_vfat(&source, &dest).expect("copy over");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "newer kernel");
        assert!(!dest.with_extension("TmpWrite").exists());
    }

    #[test]
    fn tree_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("a");
        fs::create_dir_all(src.join("dtbs")).unwrap();
        fs::write(src.join("vmlinuz"), "k").unwrap();
        fs::write(src.join("dtbs").join("board.dtb"), "d").unwrap();
        fs::set_permissions(src.join("vmlinuz"), fs::Permissions::from_mode(0o600)).unwrap();
        std::os::unix::fs::symlink("vmlinuz", src.join("kernel")).unwrap();

        let dest = dir.path().join("b");
        copy_tree(&src, &dest).expect("copy tree");

        assert_eq!(fs::read_to_string(dest.join("dtbs").join("board.dtb")).unwrap(), "d");
        assert_eq!(
            fs::metadata(dest.join("vmlinuz")).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(fs::read_link(dest.join("kernel")).unwrap(), std::path::PathBuf::from("vmlinuz"));
    }

    #[test]
    fn depth_first_removal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outer = dir.path().join("stage");
        let inner = outer.join("boot");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("initrd.img"), "i").unwrap();
        let loose = dir.path().join("vmlinuz");
        fs::write(&loose, "k").unwrap();

        remove_depth_first(vec![outer.clone(), inner.clone(), loose.clone(), dir.path().join("gone")])
            .expect("remove");
        assert!(!outer.exists());
        assert!(!loose.exists());
        assert!(dir.path().exists());
    }
}
