//! Directory-backed store: one file per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{fs, io::AsyncWriteExt};

use super::{ObjectStore, StoreError};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { key: key.to_string(), source }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(prefix)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err(prefix))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(prefix) || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if entry.file_type().await.map_err(io_err(name))?.is_file() {
                keys.push(name.to_string());
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    async fn open(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(path).await {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(io_err(key)(e)),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    async fn write(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root).await.map_err(io_err(key))?;

        // Rename into place so the final key only ever holds a complete object.
        let tmp = self.root.join(format!("{key}{TMP_SUFFIX}"));
        let mut f = fs::File::create(&tmp).await.map_err(io_err(key))?;
        f.write_all(&data).await.map_err(io_err(key))?;
        f.sync_all().await.map_err(io_err(key))?;
        drop(f);
        fs::rename(&tmp, &path).await.map_err(io_err(key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(key)(e)),
        }
    }
}
