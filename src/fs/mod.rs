// src/fs/mod.rs

//! Filesystem seam used by the workers and the disk-space guard.
//!
//! Workers never touch `std::fs` directly, so the pipeline can run against
//! [`mock::MockFileSystem`] in tests.

use std::fmt::Debug;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod guard;
pub mod mock;

pub use guard::DiskSpaceGuard;
pub use mock::MockFileSystem;

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    /// Create or truncate `path`, creating parent directories.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn file_len(&self, path: &Path) -> Result<u64>;

    /// Return a list of entries in a directory.
    /// Returns full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Move `from` to `to` so that `to` is either absent or complete.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    /// Remove a directory tree; a missing directory is not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Free bytes on the volume holding `path`.
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(path).with_context(|| format!("opening file {:?}", path))?;
        Ok(Box::new(file))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        let mut file =
            fs::File::create(path).with_context(|| format!("creating file {:?}", path))?;
        file.write_all(contents)
            .with_context(|| format!("writing to file {:?}", path))?;
        file.sync_all()
            .with_context(|| format!("syncing file {:?}", path))?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)
            .with_context(|| format!("stat {:?}", path))?
            .len())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            let entry = entry?;
            entries.push(entry.path());
        }
        Ok(entries)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("creating dir {:?}", path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                // Cross-device: copy next to the destination, then rename
                // within that volume.
                let staged = staging_sibling(to);
                fs::copy(from, &staged)
                    .with_context(|| format!("copying {:?} to {:?}", from, staged))?;
                if let Err(e) = fs::rename(&staged, to) {
                    let _ = fs::remove_file(&staged);
                    return Err(e).with_context(|| format!("renaming {:?} to {:?}", staged, to));
                }
                fs::remove_file(from).with_context(|| format!("removing {:?}", from))?;
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("renaming {:?} to {:?}", from, to)),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("removing file {:?}", path))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing dir {:?}", path)),
        }
    }

    fn available_space(&self, path: &Path) -> Result<u64> {
        // The output directory may not exist yet; measure its nearest
        // existing ancestor.
        let mut existing = path.to_path_buf();
        while !existing.exists() {
            if !existing.pop() {
                existing = PathBuf::from(".");
                break;
            }
        }
        let existing = fs::canonicalize(&existing).with_context(|| format!("canonicalizing {:?}", existing))?;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let listed = disks
            .list()
            .iter()
            .filter(|d| existing.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space());
        match listed {
            Some(bytes) => Ok(bytes),
            None => statvfs_available(&existing),
        }
    }
}

/// Overlay and tmpfs mounts are not listed by `sysinfo`; ask the kernel.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn statvfs_available(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {:?} contains a NUL byte", path))?;
    // SAFETY: `c_path` is a valid NUL-terminated string and `stat` is a
    // plain-old-data out parameter.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {:?}", path));
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
fn statvfs_available(path: &Path) -> Result<u64> {
    anyhow::bail!("no mounted volume contains {:?}", path)
}

#[cfg(unix)]
fn staging_sibling(to: &Path) -> PathBuf {
    let mut name = to.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".incoming");
    to.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_replaces_destination_and_missing_dirs_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let from = dir.path().join("a.partial");
        let to = dir.path().join("out").join("a.mp4");

        fs.write(&from, b"data").unwrap();
        fs.create_dir_all(to.parent().unwrap()).unwrap();
        fs.rename(&from, &to).unwrap();

        assert!(!fs.exists(&from));
        assert_eq!(fs.file_len(&to).unwrap(), 4);
        fs.remove_dir_all(&dir.path().join("never-created")).unwrap();
    }

    #[test]
    fn available_space_resolves_missing_paths_to_an_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let space = fs.available_space(&dir.path().join("not").join("yet"));
        assert!(space.is_ok(), "{space:?}");
    }
}
