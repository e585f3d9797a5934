use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use trove_core::{EventId, Username};

use crate::error::StoreError;

/// An open attachment body ready to stream to a response.
pub struct FileRead {
    pub size: u64,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for FileRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRead")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Pluggable file store for attachment bodies.
///
/// Uploads land in a staging area first and are moved into the per-user
/// layout when the owning event is created or updated, so a failed request
/// never leaves a half-indexed file behind.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Stage an upload; returns the temp id to pass to [`adopt`](Self::adopt).
    async fn stage(&self, data: Bytes) -> Result<String, StoreError>;

    /// Move a staged upload under `username/event_id/file_id`, returning the
    /// file size.
    async fn adopt(
        &self,
        username: &Username,
        event_id: &EventId,
        file_id: &str,
        temp_id: &str,
    ) -> Result<u64, StoreError>;

    /// Open an attachment body for streaming. `Ok(None)` when absent.
    async fn open(
        &self,
        username: &Username,
        event_id: &EventId,
        file_id: &str,
    ) -> Result<Option<FileRead>, StoreError>;

    /// Unlink one attachment file. Returns whether it existed. An in-flight
    /// reader keeps its handle; new readers see the file gone.
    async fn remove(
        &self,
        username: &Username,
        event_id: &EventId,
        file_id: &str,
    ) -> Result<bool, StoreError>;

    /// Hard-delete the event's attachment directory.
    async fn remove_event(&self, username: &Username, event_id: &EventId)
        -> Result<(), StoreError>;

    /// Hard-delete the user's attachment directory.
    async fn remove_user(&self, username: &Username) -> Result<(), StoreError>;
}

/// Local filesystem [`FileStore`]: one directory per user under the
/// attachments root, one subdirectory per event, a sibling `tmp/` staging
/// area.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
    tmp: PathBuf,
}

impl LocalFiles {
    /// Create the store, ensuring the root and staging directories exist.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let tmp = root.join("tmp");
        tokio::fs::create_dir_all(&tmp).await?;
        Ok(Self { root, tmp })
    }

    fn event_dir(&self, username: &Username, event_id: &EventId) -> PathBuf {
        self.root.join(username.as_str()).join(event_id.as_str())
    }

    fn file_path(&self, username: &Username, event_id: &EventId, file_id: &str) -> PathBuf {
        self.event_dir(username, event_id).join(file_id)
    }
}

#[async_trait]
impl FileStore for LocalFiles {
    async fn stage(&self, data: Bytes) -> Result<String, StoreError> {
        let temp_id = Uuid::new_v4().to_string();
        let path = self.tmp.join(&temp_id);
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(temp_id)
    }

    async fn adopt(
        &self,
        username: &Username,
        event_id: &EventId,
        file_id: &str,
        temp_id: &str,
    ) -> Result<u64, StoreError> {
        let staged = self.tmp.join(temp_id);
        let target = self.file_path(username, event_id, file_id);
        tokio::fs::create_dir_all(self.event_dir(username, event_id)).await?;
        tokio::fs::rename(&staged, &target).await?;
        let size = tokio::fs::metadata(&target).await?.len();
        debug!(user = %username, event = %event_id, file = file_id, size, "attachment adopted");
        Ok(size)
    }

    async fn open(
        &self,
        username: &Username,
        event_id: &EventId,
        file_id: &str,
    ) -> Result<Option<FileRead>, StoreError> {
        let path = self.file_path(username, event_id, file_id);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok(Some(FileRead {
            size,
            reader: Box::pin(file),
        }))
    }

    async fn remove(
        &self,
        username: &Username,
        event_id: &EventId,
        file_id: &str,
    ) -> Result<bool, StoreError> {
        let path = self.file_path(username, event_id, file_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_event(
        &self,
        username: &Username,
        event_id: &EventId,
    ) -> Result<(), StoreError> {
        let dir = self.event_dir(username, event_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_user(&self, username: &Username) -> Result<(), StoreError> {
        let dir = self.root.join(username.as_str());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
