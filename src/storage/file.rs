//! JSON file storage adapter.
//!
//! Each namespace is one `<namespace>.json` document holding a key → value
//! object. A document is read from disk once and then served from memory;
//! the adapter assumes it is the only writer of its directory. Writes go to a
//! temporary file that is then renamed into place, so a crash mid-write leaves
//! the previous document intact.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::StorageAdapter;
use crate::types::{Error, Result};

type Document = BTreeMap<String, Value>;

/// Directory-backed storage with one JSON document per namespace.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    /// Loaded documents. The lock also serializes read-modify-write cycles.
    docs: Mutex<HashMap<String, Document>>,
}

impl FileStorage {
    /// Open (and create if needed) the storage directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::transport(format!("create {}: {}", root.display(), e)))?;
        Ok(Self {
            root,
            docs: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_path(&self, namespace: &str) -> Result<PathBuf> {
        let valid = !namespace.is_empty()
            && !namespace.starts_with('.')
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(Error::validation(format!(
                "invalid storage namespace: {:?}",
                namespace
            )));
        }
        Ok(self.root.join(format!("{namespace}.json")))
    }

    async fn read_namespace(&self, namespace: &str) -> Result<Document> {
        let path = self.namespace_path(namespace)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::transport(format!("corrupt namespace file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::transport(format!("read {}: {}", path.display(), e))),
        }
    }

    async fn write_namespace(&self, namespace: &str, doc: &Document) -> Result<()> {
        let path = self.namespace_path(namespace)?;
        if doc.is_empty() {
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::transport(format!("remove {}: {}", path.display(), e))),
            };
        }

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::transport(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::transport(format!("rename {}: {}", path.display(), e)))
    }

    /// The cached document for `namespace`, reading it from disk on first use.
    async fn document<'a>(
        &self,
        docs: &'a mut HashMap<String, Document>,
        namespace: &str,
    ) -> Result<&'a mut Document> {
        if !docs.contains_key(namespace) {
            let doc = self.read_namespace(namespace).await?;
            docs.insert(namespace.to_string(), doc);
        }
        docs.get_mut(namespace)
            .ok_or_else(|| Error::internal(format!("namespace {} not loaded", namespace)))
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let mut docs = self.docs.lock().await;
        let doc = self.document(&mut docs, namespace).await?;
        Ok(doc.get(key).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut docs = self.docs.lock().await;
        let doc = self.document(&mut docs, namespace).await?;
        let previous = doc.insert(key.to_string(), value);
        if let Err(e) = self.write_namespace(namespace, &*doc).await {
            match previous {
                Some(old) => doc.insert(key.to_string(), old),
                None => doc.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut docs = self.docs.lock().await;
        let doc = self.document(&mut docs, namespace).await?;
        if let Some(old) = doc.remove(key) {
            if let Err(e) = self.write_namespace(namespace, &*doc).await {
                doc.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let mut docs = self.docs.lock().await;
        let doc = self.document(&mut docs, namespace).await?;
        Ok(doc.keys().cloned().collect())
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let mut docs = self.docs.lock().await;
        let doc = self.document(&mut docs, namespace).await?;
        Ok(doc.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
