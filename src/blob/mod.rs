// Blob sources
// Where regulation documents are listed and read from before ingestion

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::{RagError, Result};

/// A flat namespace of named documents
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Names of every document whose name starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn read(&self, name: &str) -> Result<Vec<u8>>;
}

/// Documents under a local directory, named by their `/`-separated relative path
#[derive(Debug, Clone)]
pub struct FsBlobSource {
    root: PathBuf,
}

impl FsBlobSource {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(RagError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Document name '{}' escapes the source directory", name),
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobSource for FsBlobSource {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.root).await? {
            debug!("Source directory {} does not exist", self.root.display());
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let Ok(relative) = path.strip_prefix(&self.root) else {
                        continue;
                    };
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if name.starts_with(prefix) {
                        names.push(name);
                    }
                }
            }
        }

        names.sort();
        debug!(
            "Listed {} documents under {} (prefix '{}')",
            names.len(),
            self.root.display(),
            prefix
        );
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        Ok(tokio::fs::read(path).await?)
    }
}

/// Documents held in memory, for embedding hosts that already have the bytes
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobSource {
    documents: BTreeMap<String, Vec<u8>>,
}

impl MemoryBlobSource {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_document(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    #[inline]
    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.documents.insert(name.into(), bytes.into());
    }
}

#[async_trait]
impl BlobSource for MemoryBlobSource {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .documents
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.documents.get(name).cloned().ok_or_else(|| {
            RagError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Document '{}' not found", name),
            ))
        })
    }
}

/// Several sources queried in order. A name present in more than one source
/// is listed once per source, and reading it returns the bytes from the last
/// source that has it.
#[derive(Clone, Default)]
pub struct ChainedBlobSource {
    sources: Vec<Arc<dyn BlobSource>>,
}

impl ChainedBlobSource {
    #[inline]
    pub fn new(sources: Vec<Arc<dyn BlobSource>>) -> Self {
        Self { sources }
    }

    #[inline]
    pub fn push(&mut self, source: Arc<dyn BlobSource>) {
        self.sources.push(source);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl BlobSource for ChainedBlobSource {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for source in &self.sources {
            names.extend(source.list(prefix).await?);
        }
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let mut last_error = None;
        for source in self.sources.iter().rev() {
            match source.read(name).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RagError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Document '{}' not found in any source", name),
            ))
        }))
    }
}
