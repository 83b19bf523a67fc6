//! Local filesystem storage.
//!
//! Blobs are streamed to a `.partial` sibling and atomically renamed into
//! place, so a final name is only ever fully written.

use super::Storage;
use crate::error::Error;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncRead;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn final_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.partial", name))
    }
}

fn map_io(what: &str, name: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::StorageNotFound(name.to_string())
    } else {
        Error::StorageUnavailable(format!("{} {}: {}", what, name, e))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let final_path = self.final_path(name);
        let partial_path = self.partial_path(name);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::StorageUnavailable(format!("mkdir: {}", e)))?;
        }

        let result = async {
            let mut file = tokio::fs::File::create(&partial_path)
                .await
                .map_err(|e| map_io("create", name, e))?;
            tokio::io::copy(reader, &mut file)
                .await
                .map_err(|e| map_io("write", name, e))?;
            file.sync_all().await.map_err(|e| map_io("sync", name, e))?;
            tokio::fs::rename(&partial_path, &final_path)
                .await
                .map_err(|e| map_io("rename", name, e))?;
            Ok(final_path.display().to_string())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial_path).await;
        }
        result
    }

    async fn get(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(self.final_path(name))
            .await
            .map_err(|e| map_io("open", name, e))?;
        Ok(Box::new(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(prefix)
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::StorageUnavailable(format!("list {}: {}", prefix, e))),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::StorageUnavailable(format!("list {}: {}", prefix, e)))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::StorageUnavailable(format!("list {}: {}", prefix, e)))?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if prefix.is_empty() {
                names.push(file_name);
            } else {
                names.push(format!("{}/{}", prefix, file_name));
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        // Clear partial state too; both removals are idempotent.
        for path in [self.final_path(name), self.partial_path(name)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::StorageUnavailable(format!("delete {}: {}", name, e))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::read_all;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = store(&dir);
        let data = b"-- dump\nCREATE TABLE a (id INT);\n".to_vec();
        storage
            .put("shop_x/dump.sql", &mut data.as_slice())
            .await
            .unwrap();
        let out = read_all(&storage, "shop_x/dump.sql").await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn put_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let storage = store(&dir);
        storage
            .put("shop_x/dump.sql", &mut b"data".as_slice())
            .await
            .unwrap();
        assert!(dir.path().join("shop_x/dump.sql").exists());
        assert!(!dir.path().join("shop_x/dump.sql.partial").exists());
    }

    #[tokio::test]
    async fn get_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).get("nope/dump.sql").await.err().unwrap();
        assert!(matches!(err, Error::StorageNotFound(_)));
    }

    #[tokio::test]
    async fn list_returns_prefixed_names() {
        let dir = TempDir::new().unwrap();
        let storage = store(&dir);
        storage
            .put("shop_x/tables.sql", &mut b"a".as_slice())
            .await
            .unwrap();
        storage
            .put("shop_x/manifest.json", &mut b"{}".as_slice())
            .await
            .unwrap();
        let names = storage.list("shop_x").await.unwrap();
        assert_eq!(names, vec!["shop_x/manifest.json", "shop_x/tables.sql"]);
        assert!(storage.list("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_blob_and_partial() {
        let dir = TempDir::new().unwrap();
        let storage = store(&dir);
        storage
            .put("shop_x/dump.sql", &mut b"a".as_slice())
            .await
            .unwrap();
        // Simulate an interrupted upload.
        tokio::fs::write(dir.path().join("shop_x/other.sql.partial"), b"x")
            .await
            .unwrap();

        storage.delete("shop_x/dump.sql").await.unwrap();
        storage.delete("shop_x/other.sql").await.unwrap();
        assert!(storage.list("shop_x").await.unwrap().is_empty());

        // Deleting again is a no-op.
        storage.delete("shop_x/dump.sql").await.unwrap();
    }
}
