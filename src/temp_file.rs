//! Scratch files used as upload payloads.
//!
//! Files are created with a unique name and removed explicitly by whoever
//! created them. Nothing here deletes a file on drop.

use crate::naming;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

/// Creates scratch files inside a fixed directory.
#[derive(Clone, Debug)]
pub struct TempFileFactory {
    dir: PathBuf,
}

impl TempFileFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `content` repeated `repeat_count` times to a freshly named file.
    ///
    /// An existing file with the same name is overwritten. IO errors are
    /// returned as-is.
    pub async fn create_temp_file(
        &self,
        repeat_count: usize,
        base_name: &str,
        content: &str,
    ) -> io::Result<TempFile> {
        let name = naming::temp_file_name(base_name);
        let path = self.dir.join(&name);
        let body = content.repeat(repeat_count);
        fs::write(&path, body.as_bytes()).await?;
        debug!("wrote {} bytes to {}", body.len(), path.display());

        Ok(TempFile {
            name,
            path,
            size_bytes: body.len() as u64,
        })
    }
}

/// A scratch file on local disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempFile {
    name: String,
    path: PathBuf,
    size_bytes: u64,
}

impl TempFile {
    /// File name without directory; also used as the object key.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub async fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path).await?;
        debug!("removed {}", self.path.display());
        Ok(())
    }
}
