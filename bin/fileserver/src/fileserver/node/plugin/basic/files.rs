use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;

use async_trait::async_trait;

use bytes::Bytes;

use snafu::ResultExt;

use crate::node::plugin::v1::{FileStorage, Flush, StorageError};
use crate::node::storage::{validate_id, FileExistsSnafu, IoSnafu};

/// One file per id under a root directory.
pub struct DiskFileStorage {
    root: PathBuf,
}

impl DiskFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        fs::create_dir_all(root.as_ref()).context(IoSnafu)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }
}

fn not_found_or_io(id: &str, e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound { id: id.into() }
    } else {
        StorageError::Io { source: e }
    }
}

#[async_trait]
impl Flush for DiskFileStorage {
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl FileStorage for DiskFileStorage {
    #[tracing::instrument(name = "files.read", level = "debug", skip(self))]
    fn read(&self, id: &str) -> Result<Bytes, StorageError> {
        let path = self.path(id)?;
        fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| not_found_or_io(id, e))
    }

    #[tracing::instrument(name = "files.write", level = "debug", skip(self, data), fields(size = data.len()))]
    fn write(&self, id: &str, data: &[u8], force: bool) -> Result<(), StorageError> {
        let path = self.path(id)?;
        snafu::ensure!(force || !path.exists(), FileExistsSnafu { id });

        // Readers never observe a partially written file.
        let tmp = path.with_extension("partial");
        fs::write(&tmp, data).context(IoSnafu)?;
        fs::rename(&tmp, &path).context(IoSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "files.del", level = "debug", skip(self))]
    fn del(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path(id)?;
        fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| not_found_or_io(id, e))?;
        Ok(())
    }
}
