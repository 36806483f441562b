//! Staging area for uploaded documents.
//!
//! Uploads are stored once, fetched by the orchestrator with the size ceiling enforced before
//! any bytes reach the extractor, and released when the request reaches a terminal state.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle to a stored upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRef(pub String);

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised by blob sources.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No blob is stored under the reference.
    #[error("blob not found: {0}")]
    NotFound(FileRef),
    /// Blob exceeds the configured ceiling.
    #[error("blob is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Actual blob size in bytes.
        size: u64,
        /// Configured ceiling in bytes.
        limit: u64,
    },
    /// Underlying storage failed.
    #[error("blob storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage for uploaded documents.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Persist an upload and return its reference.
    ///
    /// The size ceiling is not checked here; `fetch` enforces it so oversized uploads still
    /// surface as a failed request.
    async fn store(&self, name: &str, bytes: Bytes) -> Result<FileRef, BlobError>;

    /// Load the bytes behind a reference, rejecting blobs above the size ceiling.
    async fn fetch(&self, file_ref: &FileRef) -> Result<Bytes, BlobError>;

    /// Drop a stored blob. Best effort; failures are logged, never surfaced.
    fn release(&self, file_ref: &FileRef);
}

/// Releases a blob when dropped, covering success, failure, and cancellation alike.
pub struct BlobLease {
    source: Arc<dyn BlobSource>,
    file_ref: FileRef,
}

impl BlobLease {
    /// Take ownership of the blob's lifetime.
    pub fn new(source: Arc<dyn BlobSource>, file_ref: FileRef) -> Self {
        Self { source, file_ref }
    }
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        self.source.release(&self.file_ref);
    }
}

/// Blob source writing uploads under a local directory.
pub struct FsBlobSource {
    root: PathBuf,
    max_bytes: u64,
}

impl FsBlobSource {
    /// Build a source rooted at `root`; the directory is created on first store.
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    fn path_for(&self, file_ref: &FileRef) -> PathBuf {
        self.root.join(&file_ref.0)
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload.pdf".into()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl BlobSource for FsBlobSource {
    async fn store(&self, name: &str, bytes: Bytes) -> Result<FileRef, BlobError> {
        let size = bytes.len() as u64;
        tokio::fs::create_dir_all(&self.root).await?;
        let file_ref = FileRef(format!("{}_{}", Uuid::new_v4(), sanitize_name(name)));
        tokio::fs::write(self.path_for(&file_ref), &bytes).await?;
        tracing::debug!(file_ref = %file_ref, size, "Stored upload");
        Ok(file_ref)
    }

    async fn fetch(&self, file_ref: &FileRef) -> Result<Bytes, BlobError> {
        let path = self.path_for(file_ref);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(file_ref.clone()));
            }
            Err(error) => return Err(error.into()),
        };
        if metadata.len() > self.max_bytes {
            return Err(BlobError::TooLarge {
                size: metadata.len(),
                limit: self.max_bytes,
            });
        }
        Ok(Bytes::from(tokio::fs::read(&path).await?))
    }

    fn release(&self, file_ref: &FileRef) {
        let path = self.path_for(file_ref);
        let file_ref = file_ref.clone();
        let remove = move || match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(file_ref = %file_ref, "Released upload"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(file_ref = %file_ref, error = %error, "Failed to release upload");
            }
        };
        // Leases are dropped inside async tasks; keep the unlink off the executor when possible.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

/// In-process blob source, used by the CLI and tests.
pub struct MemoryBlobSource {
    blobs: DashMap<FileRef, Bytes>,
    max_bytes: u64,
}

impl MemoryBlobSource {
    /// Create an empty source with the given size ceiling.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            blobs: DashMap::new(),
            max_bytes,
        }
    }

    /// Whether a blob is still held under `file_ref`.
    pub fn contains(&self, file_ref: &FileRef) -> bool {
        self.blobs.contains_key(file_ref)
    }

    /// Number of blobs currently held.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether no blobs are held.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobSource for MemoryBlobSource {
    async fn store(&self, name: &str, bytes: Bytes) -> Result<FileRef, BlobError> {
        let file_ref = FileRef(format!("{}_{}", Uuid::new_v4(), sanitize_name(name)));
        self.blobs.insert(file_ref.clone(), bytes);
        Ok(file_ref)
    }

    async fn fetch(&self, file_ref: &FileRef) -> Result<Bytes, BlobError> {
        let bytes = self
            .blobs
            .get(file_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound(file_ref.clone()))?;
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(BlobError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(bytes)
    }

    fn release(&self, file_ref: &FileRef) {
        self.blobs.remove(file_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_strips_path_components() {
        assert_eq!(sanitize_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_name("report 2024.pdf"), "report_2024.pdf");
        assert_eq!(sanitize_name(".."), "upload.pdf");
    }

    #[tokio::test]
    async fn memory_source_enforces_ceiling_on_fetch() {
        let source = MemoryBlobSource::new(4);
        let file_ref = source
            .store("a.pdf", Bytes::from_static(b"12345"))
            .await
            .expect("store");

        let error = source.fetch(&file_ref).await.expect_err("too large");
        assert!(matches!(error, BlobError::TooLarge { size: 5, limit: 4 }));
    }

    #[tokio::test]
    async fn lease_releases_blob_on_drop() {
        let source = Arc::new(MemoryBlobSource::new(1024));
        let file_ref = source
            .store("a.pdf", Bytes::from_static(b"%PDF"))
            .await
            .expect("store");
        assert!(source.contains(&file_ref));

        drop(BlobLease::new(source.clone(), file_ref.clone()));
        assert!(!source.contains(&file_ref));
    }

    async fn wait_until_missing(source: &FsBlobSource, file_ref: &FileRef) -> BlobError {
        for _ in 0..50 {
            match source.fetch(file_ref).await {
                Err(error @ BlobError::NotFound(_)) => return error,
                _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
        panic!("blob {file_ref} was never released");
    }

    #[tokio::test]
    async fn fs_source_round_trips_and_cleans_up() {
        let root = std::env::temp_dir().join(format!("pdf-summarizer-test-{}", Uuid::new_v4()));
        let source = FsBlobSource::new(&root, 1024);

        let file_ref = source
            .store("doc.pdf", Bytes::from_static(b"%PDF-1.4"))
            .await
            .expect("store");
        let bytes = source.fetch(&file_ref).await.expect("fetch");
        assert_eq!(&bytes[..], b"%PDF-1.4");

        source.release(&file_ref);
        let error = wait_until_missing(&source, &file_ref).await;
        assert!(matches!(error, BlobError::NotFound(_)));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn fs_source_stores_oversized_uploads_and_rejects_them_on_fetch() {
        let root = std::env::temp_dir().join(format!("pdf-summarizer-test-{}", Uuid::new_v4()));
        let source = FsBlobSource::new(&root, 2);

        let file_ref = source
            .store("doc.pdf", Bytes::from_static(b"%PDF"))
            .await
            .expect("store accepts any size");
        let error = source.fetch(&file_ref).await.expect_err("too large");
        assert!(matches!(error, BlobError::TooLarge { size: 4, limit: 2 }));

        source.release(&file_ref);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn fs_release_outside_a_runtime_removes_synchronously() {
        let root = std::env::temp_dir().join(format!("pdf-summarizer-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("temp dir");
        let source = FsBlobSource::new(&root, 1024);
        let file_ref = FileRef("doc.pdf".into());
        std::fs::write(source.path_for(&file_ref), b"%PDF").expect("write");

        source.release(&file_ref);

        assert!(!source.path_for(&file_ref).exists());
        let _ = std::fs::remove_dir_all(root);
    }
}
