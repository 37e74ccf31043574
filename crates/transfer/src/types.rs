use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use partwise_protocol::{Conditions, ProgressListener, ServerSideEncryption};
use serde::Serialize;

use crate::cancel::CancelHook;
use crate::ratelimit::RateLimiter;

/// Receives lifecycle events of a transfer.
pub type EventListener = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

/// Resumable upload of one local file.
#[derive(Clone, Default)]
pub struct UploadFileRequest {
    pub bucket: String,
    pub key: String,
    pub file_path: PathBuf,
    /// Overrides the configured part size.
    pub part_size: Option<u64>,
    /// Overrides the configured worker count.
    pub task_num: Option<usize>,
    pub enable_checkpoint: bool,
    /// Checkpoint file, or a directory to keep it in.
    pub checkpoint_path: Option<PathBuf>,
    pub encoding_type: String,
    pub sse: ServerSideEncryption,
    /// Overrides the configured rate limit.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub progress: Option<ProgressListener>,
    pub events: Option<EventListener>,
    pub cancel: Option<CancelHook>,
    /// Stops retrying once this much time has passed.
    pub timeout: Option<Duration>,
}

/// Resumable download of one object into a local file.
#[derive(Clone, Default)]
pub struct DownloadFileRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    /// Target file. A directory (or a path ending in a separator) gets the
    /// last segment of the key appended.
    pub file_path: PathBuf,
    pub conditions: Conditions,
    pub sse: ServerSideEncryption,
    pub part_size: Option<u64>,
    pub task_num: Option<usize>,
    pub enable_checkpoint: bool,
    pub checkpoint_path: Option<PathBuf>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub progress: Option<ProgressListener>,
    pub events: Option<EventListener>,
    pub cancel: Option<CancelHook>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadFileOutcome {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub etag: String,
    pub location: String,
    pub version_id: String,
    pub crc64: u64,
    /// Parts skipped because an earlier run completed them.
    pub resumed_parts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadFileOutcome {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub file_path: PathBuf,
    pub etag: String,
    pub size: u64,
    pub crc64: u64,
    pub resumed_parts: usize,
}

/// Kind of a [`TransferEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferEventType {
    CreateMultipartUploadSucceed,
    CreateMultipartUploadFailed,
    UploadPartSucceed,
    UploadPartFailed,
    UploadPartAborted,
    CompleteMultipartUploadSucceed,
    CompleteMultipartUploadFailed,
    CreateTempFileSucceed,
    CreateTempFileFailed,
    DownloadPartSucceed,
    DownloadPartFailed,
    DownloadPartAborted,
    RenameTempFileSucceed,
    RenameTempFileFailed,
}

/// Part a [`TransferEvent`] is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartEventInfo {
    pub part_number: u32,
    pub offset: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etag: String,
    pub crc64: u64,
}

/// Lifecycle notification of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    #[serde(rename = "type")]
    pub kind: TransferEventType,
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub upload_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part: Option<PartEventInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl fmt::Display for TransferEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
