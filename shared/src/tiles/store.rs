use super::TileKey;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// On-disk tile cache laid out as `root/zoom/x/y.<extension>`.
///
/// Writes go to a hidden staging file in the destination directory and are
/// renamed into place, so only complete images ever appear at a tile path.
/// Nothing here deletes tiles.
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
    extension: String,
}

impl TileStore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn path(&self, key: TileKey) -> PathBuf {
        self.column_dir(key)
            .join(format!("{}.{}", key.y, self.extension))
    }

    /// Parses a `{y}.{extension}` file name back into its y index.
    pub fn parse_file_name(&self, file_name: &str) -> Option<u32> {
        let y = file_name
            .strip_suffix(&self.extension)?
            .strip_suffix('.')?;
        if y.is_empty() || !y.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        y.parse().ok()
    }

    pub async fn exists(&self, key: TileKey) -> io::Result<bool> {
        fs::try_exists(self.path(key)).await
    }

    pub async fn get(&self, key: TileKey) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put(&self, key: TileKey, bytes: &[u8]) -> io::Result<()> {
        let dir = self.column_dir(key);
        fs::create_dir_all(&dir).await?;

        let staging = dir.join(format!(
            ".{}.{}.{}.part",
            key.y,
            self.extension,
            Uuid::now_v7()
        ));
        let written = match write_synced(&staging, bytes).await {
            Ok(()) => fs::rename(&staging, self.path(key)).await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = fs::remove_file(&staging).await;
        }
        written
    }

    fn column_dir(&self, key: TileKey) -> PathBuf {
        self.root
            .join(key.zoom.to_string())
            .join(key.x.to_string())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
