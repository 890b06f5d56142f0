//! Upload sessions and the filesystem store behind them.
//!
//! A creation request using the upload token opens a session for its owner and waits. The
//! uploader then either supplies a location directly or hands over bytes, which are stored
//! and supplied as a `file://` location.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, pin_mut, stream};
use sha2::{Digest, Sha256};
use slug::slugify;
use thiserror::Error;
use tokio::{
    fs,
    io::AsyncWriteExt,
    sync::{Notify, oneshot},
};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::{
    application::collaborators::{PendingUpload, UploadError, UploadResolver},
    domain::types::OwnerId,
    util::bytes::ByteSize,
};

/// Errors that can occur while interacting with the upload storage backend.
#[derive(Debug, Error)]
pub enum UploadStorageError {
    #[error("invalid stored path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("uploaded file exceeds the limit of {limit}")]
    PayloadTooLarge { limit: ByteSize },
    #[error("uploaded file is empty")]
    EmptyPayload,
}

/// Result of storing an upload payload.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub stored_path: String,
    pub checksum: String,
    pub size_bytes: u64,
}

/// Filesystem-backed upload storage.
#[derive(Debug)]
pub struct UploadStorage {
    root: PathBuf,
    max_bytes: u64,
}

impl UploadStorage {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf, max_bytes: u64) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, max_bytes })
    }

    /// Stream the payload to disk, hashing it on the way. Partial files are removed on error.
    pub async fn store_stream<S>(
        &self,
        original_name: &str,
        stream: S,
    ) -> Result<StoredUpload, UploadStorageError>
    where
        S: futures::Stream<Item = Result<Bytes, UploadStorageError>>,
    {
        let stored_path = self.build_stored_path(original_name);
        let absolute = self.resolve(&stored_path)?;

        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&absolute).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(&absolute).await;
                    return Err(err);
                }
            };

            if chunk.is_empty() {
                continue;
            }

            total_bytes = total_bytes.saturating_add(chunk.len() as u64);
            if total_bytes > self.max_bytes {
                drop(file);
                let _ = fs::remove_file(&absolute).await;
                return Err(UploadStorageError::PayloadTooLarge {
                    limit: ByteSize(self.max_bytes),
                });
            }
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
        }

        file.flush().await?;

        if total_bytes == 0 {
            drop(file);
            let _ = fs::remove_file(&absolute).await;
            return Err(UploadStorageError::EmptyPayload);
        }

        Ok(StoredUpload {
            stored_path,
            checksum: hex::encode(hasher.finalize()),
            size_bytes: total_bytes,
        })
    }

    /// Store a fully-buffered payload.
    pub async fn store(
        &self,
        original_name: &str,
        data: Bytes,
    ) -> Result<StoredUpload, UploadStorageError> {
        let stream = stream::once(async move { Ok::<_, UploadStorageError>(data) });
        self.store_stream(original_name, stream).await
    }

    /// Remove the stored payload. Missing files are treated as success.
    pub async fn delete(&self, stored_path: &str) -> Result<(), UploadStorageError> {
        let absolute = self.resolve(stored_path)?;
        match fs::remove_file(&absolute).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(UploadStorageError::Io(err)),
        }
    }

    /// `file://` URL of a stored upload, suitable as a fetch location.
    pub fn location(&self, stored_path: &str) -> Result<String, UploadStorageError> {
        let absolute = self.resolve(stored_path)?;
        let absolute = if absolute.is_absolute() {
            absolute
        } else {
            std::env::current_dir()?.join(absolute)
        };
        Url::from_file_path(&absolute)
            .map(String::from)
            .map_err(|()| UploadStorageError::InvalidPath)
    }

    fn resolve(&self, stored_path: &str) -> Result<PathBuf, UploadStorageError> {
        let relative = Path::new(stored_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(UploadStorageError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }

    fn build_stored_path(&self, original_name: &str) -> String {
        let (year, month, day) = time::OffsetDateTime::now_utc().to_calendar_date();
        let directory = format!("{year}/{:02}/{:02}", month as u8, day);
        let identifier = Uuid::new_v4();
        let filename = sanitize_filename(original_name);
        format!("{directory}/{identifier}-{filename}")
    }
}

fn sanitize_filename(original: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let mut base = slugify(stem);
    if base.is_empty() {
        base = "upload".to_string();
    }

    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    match extension {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

#[derive(Debug, Error)]
pub enum UploadSessionError {
    #[error("no upload is pending for owner `{owner}`")]
    NotWaiting { owner: OwnerId },
    #[error(transparent)]
    Storage(#[from] UploadStorageError),
}

/// Pending upload sessions, at most one per owner.
pub struct UploadSessions {
    storage: UploadStorage,
    pending: DashMap<OwnerId, oneshot::Sender<Result<String, UploadError>>>,
    opened: Notify,
    timeout: Duration,
}

impl UploadSessions {
    pub fn new(storage: UploadStorage, timeout: Duration) -> Self {
        Self {
            storage,
            pending: DashMap::new(),
            opened: Notify::new(),
            timeout,
        }
    }

    /// Whether a creation is currently waiting on an upload from `owner`.
    pub fn is_waiting(&self, owner: OwnerId) -> bool {
        self.pending
            .get(&owner)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Resolves once a creation for `owner` is waiting on an upload.
    pub async fn session_opened(&self, owner: OwnerId) {
        loop {
            let opened = self.opened.notified();
            if self.is_waiting(owner) {
                return;
            }
            opened.await;
        }
    }

    /// Complete the owner's session with an already fetchable location.
    pub fn supply(&self, owner: OwnerId, location: impl Into<String>) -> Result<(), UploadSessionError> {
        let (_, sender) = self
            .pending
            .remove(&owner)
            .ok_or(UploadSessionError::NotWaiting { owner })?;
        sender
            .send(Ok(location.into()))
            .map_err(|_| UploadSessionError::NotWaiting { owner })?;
        debug!(target = "infra::uploads", owner = %owner, "upload supplied");
        Ok(())
    }

    /// Store `data` and complete the owner's session with its `file://` location.
    pub async fn store_and_supply(
        &self,
        owner: OwnerId,
        original_name: &str,
        data: Bytes,
    ) -> Result<StoredUpload, UploadSessionError> {
        if !self.is_waiting(owner) {
            return Err(UploadSessionError::NotWaiting { owner });
        }

        let stored = self.storage.store(original_name, data).await?;
        let location = self.storage.location(&stored.stored_path)?;
        if let Err(err) = self.supply(owner, location) {
            let _ = self.storage.delete(&stored.stored_path).await;
            return Err(err);
        }

        info!(
            target = "infra::uploads",
            owner = %owner,
            path = %stored.stored_path,
            size = %ByteSize(stored.size_bytes),
            checksum = %stored.checksum,
            "upload stored"
        );
        Ok(stored)
    }

    /// Abort the owner's session; the waiting creation fails with a cancellation.
    pub fn cancel(&self, owner: OwnerId) -> bool {
        match self.pending.remove(&owner) {
            Some((_, sender)) => sender.send(Err(UploadError::Cancelled)).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl UploadResolver for UploadSessions {
    async fn new_pending_upload(&self, owner: OwnerId) -> Result<PendingUpload, UploadError> {
        // Sessions whose creation gave up (timeout, dropped handle) are never supplied.
        self.pending.retain(|_, waiting| !waiting.is_closed());

        let (sender, receiver) = oneshot::channel();
        if let Some(previous) = self.pending.insert(owner, sender) {
            let _ = previous.send(Err(UploadError::Superseded));
        }
        self.opened.notify_waiters();
        Ok(PendingUpload::new(owner, receiver, self.timeout))
    }
}
