//! Interaction serializer
//!
//! Each request opens a new cassette that stays open until the response with
//! the same id arrives.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::hooks::RawRequestTransformFn;
use crate::interaction::{RequestId, RequestInfo, ResponseInfo};
use crate::storage::{create_cassette, encode_request, encode_response, file_stem};
use crate::Result;

struct PendingCassette {
    path: PathBuf,
    file: File,
}

/// Writes request/response pairs to cassette files as they complete
pub struct HttpSerializer {
    storage_path: RwLock<PathBuf>,
    pending: DashMap<RequestId, PendingCassette>,
    raw_request_transform: Option<RawRequestTransformFn>,
}

impl HttpSerializer {
    /// Create a serializer writing into `storage_path`
    #[must_use]
    pub fn new(storage_path: PathBuf, raw_request_transform: Option<RawRequestTransformFn>) -> Self {
        Self {
            storage_path: RwLock::new(storage_path),
            pending: DashMap::new(),
            raw_request_transform,
        }
    }

    /// Create the storage directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub async fn initialize(&self) -> Result<()> {
        let path = self.storage_path.read().await;
        tokio::fs::create_dir_all(&*path).await?;
        debug!("Storage path ready: {}", path.display());
        Ok(())
    }

    /// Write future cassettes into `path`, creating it first
    ///
    /// Cassettes already open stay where they are.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub async fn set_storage_path(&self, path: PathBuf) -> Result<()> {
        let mut current = self.storage_path.write().await;
        tokio::fs::create_dir_all(&path).await?;
        info!("Recording into {}", path.display());
        *current = path;
        Ok(())
    }

    /// Current storage directory
    pub async fn storage_path(&self) -> PathBuf {
        self.storage_path.read().await.clone()
    }

    /// Number of cassettes waiting for their response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a cassette for `request` and write the request block
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub async fn on_request(&self, request: RequestInfo, label: &str) -> Result<()> {
        let id = request.id;
        let request = match &self.raw_request_transform {
            Some(transform) => transform(request),
            None => request,
        };

        let data = encode_request(&request)?;
        let stem = file_stem(label, &request);
        let dir = self.storage_path.read().await.clone();

        let (path, mut file) = create_cassette(&dir, &stem).await?;
        file.write_all(data.as_bytes()).await?;
        debug!("Opened {}", display_name(&path));

        self.pending.insert(id, PendingCassette { path, file });
        Ok(())
    }

    /// Append the response block and close its cassette
    ///
    /// A response with no open cassette is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub async fn on_response(&self, response: ResponseInfo) -> Result<()> {
        let Some((_, mut pending)) = self.pending.remove(&response.request_id) else {
            warn!(
                "No open cassette for response to request {}, dropping it",
                response.request_id
            );
            return Ok(());
        };

        let data = encode_response(&response)?;
        pending.file.write_all(data.as_bytes()).await?;
        pending.file.flush().await?;
        debug!("Closed {}", display_name(&pending.path));
        Ok(())
    }

    /// Discard the cassette of a request that will never get a response
    ///
    /// The half-written file is removed so the scenario stays loadable.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be removed
    pub async fn abandon(&self, request_id: RequestId) -> Result<()> {
        let Some((_, pending)) = self.pending.remove(&request_id) else {
            debug!("No open cassette for abandoned request {}", request_id);
            return Ok(());
        };

        drop(pending.file);
        tokio::fs::remove_file(&pending.path).await?;
        info!("Discarded incomplete {}", display_name(&pending.path));
        Ok(())
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
