// src/fs/guard.rs

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use super::FileSystem;

/// Free-space check consulted before every admission.
#[derive(Debug, Clone)]
pub struct DiskSpaceGuard {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl DiskSpaceGuard {
    /// Measure the volume that holds `path` (normally the output directory).
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    /// True if at least `minimum_free_bytes` are available.
    ///
    /// A failed measurement counts as no headroom.
    pub fn has_headroom(&self, minimum_free_bytes: u64) -> bool {
        match self.fs.available_space(&self.path) {
            Ok(free) => free >= minimum_free_bytes,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not measure free space");
                false
            }
        }
    }
}
