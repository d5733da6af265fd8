use std::{io::ErrorKind, ops::Deref, path::PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::fs::operations::{write_atomically, LockGuard};

use super::entities::StoreDocument;

pub const STORE_FILE_NAME: &str = "store.json";

/// Interface for abstracting the persisted key-value document.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads the whole document. A store that was never written yields the default document.
    async fn load(&self) -> Result<StoreDocument>;

    /// Replaces the whole document. Either every change lands or none does.
    async fn save(&self, document: &StoreDocument) -> Result<()>;
}

#[async_trait]
impl<T: Deref + Send + Sync> DocumentStore for T
where
    T::Target: DocumentStore,
{
    async fn load(&self) -> Result<StoreDocument> {
        self.deref().load().await
    }

    async fn save(&self, document: &StoreDocument) -> Result<()> {
        self.deref().save(document).await
    }
}

/// The main realization of [DocumentStore]: one JSON file in the application directory.
pub struct JsonDocumentStore {
    path: PathBuf,
}

impl JsonDocumentStore {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            path: dir.join(STORE_FILE_NAME),
        })
    }
}

#[async_trait]
impl DocumentStore for JsonDocumentStore {
    async fn load(&self) -> Result<StoreDocument> {
        let guard = LockGuard::shared(&self.path).await?;
        let read = tokio::fs::read(&self.path).await;
        guard.release().await?;

        match read {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Store at {:?} is not a valid document", self.path)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No store at {:?} yet", self.path);
                Ok(StoreDocument::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &StoreDocument) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        let guard = LockGuard::exclusive(&self.path).await?;
        let result = write_atomically(&self.path, &bytes).await;
        guard.release().await?;
        result?;
        Ok(())
    }
}

#[cfg(test)]
pub mod test_store {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use anyhow::anyhow;

    use super::*;

    /// In-memory store that counts writes and can be told to fail them.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        document: Arc<Mutex<StoreDocument>>,
        saves: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    impl MemoryStore {
        pub fn with_document(document: StoreDocument) -> Self {
            let store = Self::default();
            *store.document.lock().unwrap() = document;
            store
        }

        pub fn snapshot(&self) -> StoreDocument {
            self.document.lock().unwrap().clone()
        }

        pub fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn load(&self) -> Result<StoreDocument> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("store unavailable"));
            }
            Ok(self.snapshot())
        }

        async fn save(&self, document: &StoreDocument) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("store unavailable"));
            }
            *self.document.lock().unwrap() = document.clone();
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use crate::daemon::storage::entities::UsageClass;

    use super::*;

    #[tokio::test]
    async fn test_missing_store_loads_default() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonDocumentStore::new(dir.path().to_path_buf())?;
        assert_eq!(store.load().await?, StoreDocument::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonDocumentStore::new(dir.path().to_path_buf())?;

        let mut document = StoreDocument::default();
        document.blocked_sites.push("example.com".into());
        document.usage.entry("docs.rs".into()).or_default().add(
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            42,
            UsageClass::General,
        );
        store.save(&document).await?;

        let reopened = JsonDocumentStore::new(dir.path().to_path_buf())?;
        assert_eq!(reopened.load().await?, document);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_store_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(STORE_FILE_NAME), b"{not json")?;
        let store = JsonDocumentStore::new(dir.path().to_path_buf())?;
        assert!(store.load().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_keys_are_accepted() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(
            dir.path().join(STORE_FILE_NAME),
            br#"{"usage": {"a.com": {"cumulative": 90, "2024-01-02": 60}}, "blockedSites": ["b.com"]}"#,
        )?;
        let store = JsonDocumentStore::new(dir.path().to_path_buf())?;
        let document = store.load().await?;

        let record = &document.usage["a.com"];
        assert_eq!(record.cumulative, 90);
        assert_eq!(record.seconds_on(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()), 60);
        assert_eq!(document.blocked_sites, vec!["b.com"]);
        Ok(())
    }
}
