//! Resumable parallel multipart transfers.
//!
//! Files are split into parts that a pool of workers moves concurrently
//! through an [`ObjectTransport`]. Completed parts are recorded in a JSON
//! checkpoint so an interrupted transfer picks up where it stopped.

mod cancel;
mod checkpoint;
mod checksum;
mod config;
mod download;
mod error;
mod manager;
mod planner;
mod ratelimit;
mod retry;
mod scheduler;
mod state;
mod stream;
mod task;
mod throughput;
mod transport;
mod types;
mod upload;
mod validation;

#[cfg(test)]
mod testing;

pub use cancel::{CancelAction, CancelHook};
pub use checkpoint::{
    Checkpoint, CheckpointStore, DOWNLOAD_SUFFIX, DownloadCheckpoint, DownloadFileInfo,
    DownloadIdentity, DownloadObjectInfo, DownloadPartInfo, PartRecord, UPLOAD_SUFFIX,
    UploadCheckpoint, UploadFileInfo, UploadIdentity, UploadPartInfo, identity_digest,
    load as load_checkpoint, resolve_path,
};
pub use checksum::{crc64_bytes, crc64_combine, crc64_combine_all, crc64_file};
pub use config::TransferConfig;
pub use download::download_file;
pub use error::TransferError;
pub use manager::TransferManager;
pub use planner::{PartLimits, PartPlan, part_count, plan_parts, plan_upload_parts};
pub use ratelimit::{RateLimiter, TokenBucket};
pub use retry::{
    CallContext, Classifier, DEFAULT_BACKOFF_BASE, DEFAULT_JITTER, DEFAULT_MAX_RETRIES,
    MAX_BACKOFF, RetryAction, RetryPolicy, StatusCodeClassifier,
};
pub use scheduler::{SchedulerOutcome, SchedulerState, Task, TaskFailure, TaskScheduler};
pub use state::{TransferPhase, TransferState};
pub use stream::{
    ChecksumHandle, ChecksumReader, DecoratedStream, Direction, PARALLEL_FLUSH_THRESHOLD,
    ParallelProgress, ParallelProgressReader, ProgressReader, RateLimitedReader, StreamPipeline,
};
pub use throughput::ThroughputMeter;
pub use transport::ObjectTransport;
pub use types::{
    DownloadFileOutcome, DownloadFileRequest, EventListener, PartEventInfo, TransferEvent,
    TransferEventType, UploadFileOutcome, UploadFileRequest,
};
pub use upload::upload_file;
pub use validation::{file_name_for_key, resolve_download_target, validate_object_name};
