//! File-blob family: every context in one document.
//!
//! The document lives behind a single mutex. The `json` flavour rewrites
//! the whole file after each mutation (temp file + rename), so a crash
//! never leaves a half-written document behind. Primitives are not atomic
//! across a whole context, so [`DbDriver::is_concurrent`] is `false` and
//! the storage service serialises calls per id.

pub mod document;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use ctxstore_core::domain::{FieldKey, FieldName, MainInfo};
use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::{DbDriver, FieldItems};

pub use document::BlobDocument;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Persistence {
    Memory,
    JsonFile(PathBuf),
}

#[derive(Debug)]
pub struct BlobDriver {
    persistence: Persistence,
    document: Mutex<BlobDocument>,
}

impl BlobDriver {
    /// Process-local store, lost on exit.
    pub fn memory() -> Self {
        Self {
            persistence: Persistence::Memory,
            document: Mutex::new(BlobDocument::default()),
        }
    }

    /// Open (or create) a JSON document at `path`.
    pub async fn open_json(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(StorageError::invalid_config(
                "json storage needs a file path, e.g. json://./data/contexts.json",
            ));
        }

        let document = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BlobDocument::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                error!("Unreadable context document {}: {}", path.display(), e);
                StorageError::capability_missing("json", format!("{} is not a context document: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BlobDocument::default(),
            Err(e) => {
                return Err(StorageError::capability_missing(
                    "json",
                    format!("cannot open {}: {}", path.display(), e),
                ))
            }
        };

        let driver = Self {
            persistence: Persistence::JsonFile(path.clone()),
            document: Mutex::new(document),
        };
        // Probe writability up front rather than on the first write.
        {
            let document = driver.document.lock().await;
            driver.persist(&document).await.map_err(|e| {
                StorageError::capability_missing("json", format!("cannot write {}: {}", path.display(), e))
            })?;
        }
        info!("Opened JSON context store at {}", path.display());
        Ok(driver)
    }

    async fn persist(&self, document: &BlobDocument) -> std::io::Result<()> {
        let Persistence::JsonFile(path) = &self.persistence else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(document).map_err(std::io::Error::other)?;

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, path).await
    }

    /// Apply a mutation and write the document back.
    ///
    /// File-backed stores mutate a copy and only swap it in once it is on
    /// disk, so a failed or cancelled write leaves the shared document as
    /// it was.
    async fn mutate<T>(
        &self,
        operation: &'static str,
        id: &str,
        apply: impl FnOnce(&mut BlobDocument) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut document = self.document.lock().await;
        if self.persistence == Persistence::Memory {
            return apply(&mut document);
        }

        let mut next = document.clone();
        let result = apply(&mut next)?;
        self.persist(&next).await.map_err(|e| {
            error!("Failed to persist context document during {}: {}", operation, e);
            StorageError::backend(self.backend(), operation, id, e)
        })?;
        *document = next;
        Ok(result)
    }
}

#[async_trait]
impl DbDriver for BlobDriver {
    fn backend(&self) -> &'static str {
        match self.persistence {
            Persistence::Memory => "memory",
            Persistence::JsonFile(_) => "json",
        }
    }

    fn is_concurrent(&self) -> bool {
        false
    }

    async fn load_main_info(&self, id: &str) -> StorageResult<Option<MainInfo>> {
        Ok(self.document.lock().await.load_main(id))
    }

    async fn update_main_info(&self, id: &str, info: &MainInfo) -> StorageResult<()> {
        self.mutate("update_main_info", id, |doc| {
            doc.update_main(id, info);
            Ok(())
        })
        .await
    }

    async fn delete_main_info(&self, id: &str) -> StorageResult<()> {
        self.mutate("delete_main_info", id, |doc| {
            doc.delete_main(id);
            Ok(())
        })
        .await
    }

    async fn load_field_latest(
        &self,
        id: &str,
        field: FieldName,
        limit: Option<usize>,
    ) -> StorageResult<FieldItems> {
        Ok(self.document.lock().await.field_latest(id, field, limit))
    }

    async fn load_field_keys(&self, id: &str, field: FieldName) -> StorageResult<BTreeSet<FieldKey>> {
        Ok(self.document.lock().await.field_keys(id, field))
    }

    async fn load_field_items(
        &self,
        id: &str,
        field: FieldName,
        keys: &BTreeSet<FieldKey>,
    ) -> StorageResult<FieldItems> {
        Ok(self.document.lock().await.field_items(id, field, keys))
    }

    async fn update_field_items(
        &self,
        id: &str,
        field: FieldName,
        items: &[(FieldKey, Option<Vec<u8>>)],
    ) -> StorageResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        debug!("Updating {} {} entries of {}", items.len(), field, id);
        self.mutate("update_field_items", id, |doc| doc.update_items(id, field, items))
            .await
    }

    async fn delete_context(&self, id: &str) -> StorageResult<()> {
        self.mutate("delete_context", id, |doc| {
            doc.delete_context(id);
            Ok(())
        })
        .await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.mutate("clear_all", "*", |doc| {
            doc.clear();
            Ok(())
        })
        .await
    }
}
