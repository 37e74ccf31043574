//! Entry point bundling a transport with a configuration.

use std::sync::Arc;

use crate::TransferError;
use crate::config::TransferConfig;
use crate::download::download_file;
use crate::transport::ObjectTransport;
use crate::types::{DownloadFileOutcome, DownloadFileRequest, UploadFileOutcome, UploadFileRequest};
use crate::upload::upload_file;

/// Runs uploads and downloads against one transport.
///
/// The engine itself is blocking; the async methods move each transfer
/// onto tokio's blocking pool.
#[derive(Clone)]
pub struct TransferManager {
    transport: Arc<dyn ObjectTransport>,
    config: Arc<TransferConfig>,
}

impl TransferManager {
    pub fn new(transport: Arc<dyn ObjectTransport>, config: TransferConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config.sanitized()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn upload_file_blocking(
        &self,
        req: UploadFileRequest,
    ) -> Result<UploadFileOutcome, TransferError> {
        upload_file(&self.transport, &self.config, req)
    }

    pub fn download_file_blocking(
        &self,
        req: DownloadFileRequest,
    ) -> Result<DownloadFileOutcome, TransferError> {
        download_file(&self.transport, &self.config, req)
    }

    pub async fn upload_file(
        &self,
        req: UploadFileRequest,
    ) -> Result<UploadFileOutcome, TransferError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.upload_file_blocking(req))
            .await
            .map_err(|e| TransferError::WorkerPanic(e.to_string()))?
    }

    pub async fn download_file(
        &self,
        req: DownloadFileRequest,
    ) -> Result<DownloadFileOutcome, TransferError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.download_file_blocking(req))
            .await
            .map_err(|e| TransferError::WorkerPanic(e.to_string()))?
    }
}
