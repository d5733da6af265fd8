use std::path::{Path, PathBuf};

use anyhow::Result;
use fs4::tokio::AsyncFileExt;
use tokio::{fs::File, io::AsyncWriteExt};

/// Replaces the contents of `path` so that readers observe either the old or the new bytes,
/// never a torn write. Data goes to a sibling temp file which is synced and renamed over the
/// target.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let temp_path = sibling_with_suffix(path, "tmp");
    let mut temp = File::create(&temp_path).await?;
    temp.write_all(bytes).await?;
    temp.sync_all().await?;
    drop(temp);
    tokio::fs::rename(&temp_path, path).await
}

/// Advisory lock held next to a data file for the duration of a read or write.
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    pub async fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lock_file(path).await?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    pub async fn shared(path: &Path) -> Result<Self> {
        let file = open_lock_file(path).await?;
        file.lock_shared()?;
        Ok(Self { file })
    }

    pub async fn release(self) -> Result<()> {
        self.file.unlock_async().await?;
        Ok(())
    }
}

async fn open_lock_file(path: &Path) -> Result<File, std::io::Error> {
    File::options()
        .write(true)
        .create(true)
        .read(true)
        .truncate(false)
        .open(sibling_with_suffix(path, "lock"))
        .await
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_write_atomically_replaces_contents() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.json");

        write_atomically(&path, b"first").await?;
        write_atomically(&path, b"second").await?;

        assert_eq!(tokio::fs::read_to_string(&path).await?, "second");
        assert!(!dir.path().join("store.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_guard_can_be_reacquired_after_release() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.json");

        let guard = LockGuard::exclusive(&path).await?;
        guard.release().await?;
        let guard = LockGuard::shared(&path).await?;
        guard.release().await?;

        assert!(dir.path().join("store.json.lock").exists());
        Ok(())
    }
}
