//! Resumable transfer checkpoints.
//!
//! The on-disk layout uses the field names and omission rules of the Go
//! SDK's checkpoint files, so a transfer started by either client can be
//! resumed by the other.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use partwise_protocol::messages::CompletedPart;
use partwise_protocol::{Conditions, ObjectMeta, ServerSideEncryption};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::TransferError;
use crate::planner::PartPlan;

pub const UPLOAD_SUFFIX: &str = "upload";
pub const DOWNLOAD_SUFFIX: &str = "download";

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

// ---------------------------------------------------------------------------
// Record traits
// ---------------------------------------------------------------------------

/// One part slot of a checkpoint.
pub trait PartRecord: Clone {
    fn part_number(&self) -> u32;
    fn is_completed(&self) -> bool;
    fn size(&self) -> u64;
}

/// A checkpoint: identity fields plus a fixed, part-number-indexed slot list.
pub trait Checkpoint: Serialize + DeserializeOwned + Clone + Send + 'static {
    type Part: PartRecord + Send;

    fn parts(&self) -> &[Self::Part];
    fn parts_mut(&mut self) -> &mut [Self::Part];

    /// Bytes already covered by completed parts.
    fn completed_bytes(&self) -> u64 {
        self.parts()
            .iter()
            .filter(|p| p.is_completed())
            .map(PartRecord::size)
            .sum()
    }

    /// Returns `true` if slot `i` holds part `i + 1` for every slot.
    fn has_indexed_parts(&self) -> bool {
        self.parts()
            .iter()
            .enumerate()
            .all(|(i, p)| p.part_number() as usize == i + 1)
    }
}

// ---------------------------------------------------------------------------
// Upload checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileInfo {
    /// Unix seconds.
    #[serde(rename = "LastModified", default, skip_serializing_if = "is_zero_i64")]
    pub last_modified: i64,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPartInfo {
    #[serde(rename = "PartNumber", default)]
    pub part_number: u32,
    #[serde(rename = "PartSize", default)]
    pub part_size: u64,
    #[serde(rename = "Offset", default)]
    pub offset: u64,
    #[serde(rename = "ETag", default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(rename = "HashCrc64Ecma", default, skip_serializing_if = "is_zero_u64")]
    pub crc64: u64,
    #[serde(rename = "IsCompleted", default)]
    pub is_completed: bool,
}

impl PartRecord for UploadPartInfo {
    fn part_number(&self) -> u32 {
        self.part_number
    }

    fn is_completed(&self) -> bool {
        self.is_completed
    }

    fn size(&self) -> u64 {
        self.part_size
    }
}

impl From<&PartPlan> for UploadPartInfo {
    fn from(plan: &PartPlan) -> Self {
        Self {
            part_number: plan.part_number,
            part_size: plan.size,
            offset: plan.offset,
            ..Default::default()
        }
    }
}

/// What an upload checkpoint must match to be resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadIdentity {
    pub bucket: String,
    pub key: String,
    pub part_size: u64,
    pub sse_algorithm: String,
    pub sse_key_md5: String,
    pub encoding_type: String,
    pub file_path: String,
    pub file_size: u64,
    /// Unix seconds.
    pub file_mtime: i64,
}

impl UploadIdentity {
    pub fn with_sse(mut self, sse: &ServerSideEncryption) -> Self {
        self.sse_algorithm = sse.customer_algorithm.clone();
        self.sse_key_md5 = sse.customer_key_md5.clone();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    #[serde(rename = "Bucket", default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(rename = "Key", default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(rename = "UploadID", default, skip_serializing_if = "String::is_empty")]
    pub upload_id: String,
    #[serde(rename = "PartSize", default)]
    pub part_size: u64,
    #[serde(rename = "SSECAlgorithm", default, skip_serializing_if = "String::is_empty")]
    pub sse_algorithm: String,
    #[serde(rename = "SSECKeyMD5", default, skip_serializing_if = "String::is_empty")]
    pub sse_key_md5: String,
    #[serde(rename = "EncodingType", default, skip_serializing_if = "String::is_empty")]
    pub encoding_type: String,
    #[serde(rename = "FilePath", default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(rename = "FileInfo", default)]
    pub file_info: UploadFileInfo,
    #[serde(rename = "PartsInfo", default, skip_serializing_if = "Vec::is_empty")]
    pub parts_info: Vec<UploadPartInfo>,
}

impl Checkpoint for UploadCheckpoint {
    type Part = UploadPartInfo;

    fn parts(&self) -> &[UploadPartInfo] {
        &self.parts_info
    }

    fn parts_mut(&mut self) -> &mut [UploadPartInfo] {
        &mut self.parts_info
    }
}

impl UploadCheckpoint {
    /// Fresh checkpoint for a new multipart upload, every part incomplete.
    pub fn create(identity: &UploadIdentity, upload_id: &str, plan: &[PartPlan]) -> Self {
        Self {
            bucket: identity.bucket.clone(),
            key: identity.key.clone(),
            upload_id: upload_id.to_string(),
            part_size: identity.part_size,
            sse_algorithm: identity.sse_algorithm.clone(),
            sse_key_md5: identity.sse_key_md5.clone(),
            encoding_type: identity.encoding_type.clone(),
            file_path: identity.file_path.clone(),
            file_info: UploadFileInfo {
                last_modified: identity.file_mtime,
                size: identity.file_size,
            },
            parts_info: plan.iter().map(UploadPartInfo::from).collect(),
        }
    }

    /// All-or-nothing match against the current request and local file.
    pub fn is_valid_for(&self, expected: &UploadIdentity, expected_parts: usize) -> bool {
        !self.upload_id.is_empty()
            && self.bucket == expected.bucket
            && self.key == expected.key
            && self.file_path == expected.file_path
            && self.file_info.size == expected.file_size
            && self.file_info.last_modified == expected.file_mtime
            && self.part_size == expected.part_size
            && self.sse_algorithm == expected.sse_algorithm
            && self.sse_key_md5 == expected.sse_key_md5
            && self.encoding_type == expected.encoding_type
            && self.parts_info.len() == expected_parts
            && self.has_indexed_parts()
    }

    /// Completion manifest, ordered by part number.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts_info
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Download checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadObjectInfo {
    #[serde(rename = "Etag", default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(rename = "HashCrc64Ecma", default, skip_serializing_if = "is_zero_u64")]
    pub crc64: u64,
    #[serde(rename = "LastModified", with = "partwise_protocol::go_time", default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "ObjectSize", default, skip_serializing_if = "is_zero_u64")]
    pub object_size: u64,
}

impl From<&ObjectMeta> for DownloadObjectInfo {
    fn from(meta: &ObjectMeta) -> Self {
        Self {
            etag: meta.etag.clone(),
            crc64: meta.crc64,
            last_modified: meta.last_modified,
            object_size: meta.size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileInfo {
    #[serde(rename = "FilePath", default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(rename = "TempFilePath", default, skip_serializing_if = "String::is_empty")]
    pub temp_file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPartInfo {
    #[serde(rename = "PartNumber", default, skip_serializing_if = "is_zero_u32")]
    pub part_number: u32,
    #[serde(rename = "RangeStart", default)]
    pub range_start: u64,
    /// Inclusive.
    #[serde(rename = "RangeEnd", default, skip_serializing_if = "is_zero_u64")]
    pub range_end: u64,
    #[serde(rename = "HashCrc64Ecma", default, skip_serializing_if = "is_zero_u64")]
    pub crc64: u64,
    #[serde(rename = "IsCompleted", default)]
    pub is_completed: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl PartRecord for DownloadPartInfo {
    fn part_number(&self) -> u32 {
        self.part_number
    }

    fn is_completed(&self) -> bool {
        self.is_completed
    }

    fn size(&self) -> u64 {
        (self.range_end + 1).saturating_sub(self.range_start)
    }
}

impl From<&PartPlan> for DownloadPartInfo {
    fn from(plan: &PartPlan) -> Self {
        Self {
            part_number: plan.part_number,
            range_start: plan.offset,
            range_end: plan.range_end(),
            ..Default::default()
        }
    }
}

/// What a download checkpoint must match to be resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadIdentity {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub part_size: u64,
    pub conditions: Conditions,
    pub sse_algorithm: String,
    pub sse_key_md5: String,
    pub file_path: String,
}

impl DownloadIdentity {
    pub fn with_sse(mut self, sse: &ServerSideEncryption) -> Self {
        self.sse_algorithm = sse.customer_algorithm.clone();
        self.sse_key_md5 = sse.customer_key_md5.clone();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCheckpoint {
    #[serde(rename = "Bucket", default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(rename = "Key", default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(rename = "VersionID", default, skip_serializing_if = "String::is_empty")]
    pub version_id: String,
    #[serde(rename = "PartSize", default, skip_serializing_if = "is_zero_u64")]
    pub part_size: u64,
    #[serde(rename = "IfMatch", default, skip_serializing_if = "String::is_empty")]
    pub if_match: String,
    #[serde(rename = "IfModifiedSince", with = "partwise_protocol::go_time", default)]
    pub if_modified_since: Option<DateTime<Utc>>,
    #[serde(rename = "IfNoneMatch", default, skip_serializing_if = "String::is_empty")]
    pub if_none_match: String,
    #[serde(rename = "IfUnmodifiedSince", with = "partwise_protocol::go_time", default)]
    pub if_unmodified_since: Option<DateTime<Utc>>,
    #[serde(rename = "SSECAlgorithm", default, skip_serializing_if = "String::is_empty")]
    pub sse_algorithm: String,
    #[serde(rename = "SSECKeyMD5", default, skip_serializing_if = "String::is_empty")]
    pub sse_key_md5: String,
    #[serde(rename = "ObjectInfo", default)]
    pub object_info: DownloadObjectInfo,
    #[serde(rename = "FileInfo", default)]
    pub file_info: DownloadFileInfo,
    #[serde(rename = "PartsInfo", default, skip_serializing_if = "Vec::is_empty")]
    pub parts_info: Vec<DownloadPartInfo>,
}

impl Checkpoint for DownloadCheckpoint {
    type Part = DownloadPartInfo;

    fn parts(&self) -> &[DownloadPartInfo] {
        &self.parts_info
    }

    fn parts_mut(&mut self) -> &mut [DownloadPartInfo] {
        &mut self.parts_info
    }
}

impl DownloadCheckpoint {
    pub fn create(
        identity: &DownloadIdentity,
        meta: &ObjectMeta,
        temp_file_path: &str,
        plan: &[PartPlan],
    ) -> Self {
        Self {
            bucket: identity.bucket.clone(),
            key: identity.key.clone(),
            version_id: identity.version_id.clone(),
            part_size: identity.part_size,
            if_match: identity.conditions.if_match.clone(),
            if_modified_since: identity.conditions.if_modified_since,
            if_none_match: identity.conditions.if_none_match.clone(),
            if_unmodified_since: identity.conditions.if_unmodified_since,
            sse_algorithm: identity.sse_algorithm.clone(),
            sse_key_md5: identity.sse_key_md5.clone(),
            object_info: DownloadObjectInfo::from(meta),
            file_info: DownloadFileInfo {
                file_path: identity.file_path.clone(),
                temp_file_path: temp_file_path.to_string(),
            },
            parts_info: plan.iter().map(DownloadPartInfo::from).collect(),
        }
    }

    pub fn conditions(&self) -> Conditions {
        Conditions {
            if_match: self.if_match.clone(),
            if_modified_since: self.if_modified_since,
            if_none_match: self.if_none_match.clone(),
            if_unmodified_since: self.if_unmodified_since,
        }
    }

    /// All-or-nothing match against the current request and live metadata.
    pub fn is_valid_for(
        &self,
        expected: &DownloadIdentity,
        live: &ObjectMeta,
        expected_parts: usize,
    ) -> bool {
        self.bucket == expected.bucket
            && self.key == expected.key
            && self.version_id == expected.version_id
            && self.part_size == expected.part_size
            && self.conditions() == expected.conditions
            && self.sse_algorithm == expected.sse_algorithm
            && self.sse_key_md5 == expected.sse_key_md5
            && self.object_info == DownloadObjectInfo::from(live)
            && self.file_info.file_path == expected.file_path
            && self.parts_info.len() == expected_parts
            && self.has_indexed_parts()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Reads a checkpoint file.
///
/// A missing file is `Ok(None)`. A file that does not parse is logged,
/// removed and also reported as `Ok(None)`.
pub fn load<C: Checkpoint>(path: &Path) -> Result<Option<C>, TransferError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<C>(&raw) {
        Ok(checkpoint) => Ok(Some(checkpoint)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt checkpoint, discarding");
            remove_quietly(path);
            Ok(None)
        }
    }
}

/// Removes `path`, logging instead of failing.
pub(crate) fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

/// Live checkpoint of a running transfer.
///
/// Part slots are updated and the file rewritten under one lock, so
/// persists never interleave. Without a path the checkpoint is kept in
/// memory only.
pub struct CheckpointStore<C: Checkpoint> {
    path: Option<PathBuf>,
    inner: Mutex<StoreInner<C>>,
}

struct StoreInner<C> {
    checkpoint: C,
    discarded: bool,
}

impl<C: Checkpoint> CheckpointStore<C> {
    pub fn new(checkpoint: C, path: Option<PathBuf>) -> Self {
        Self {
            path,
            inner: Mutex::new(StoreInner {
                checkpoint,
                discarded: false,
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> C {
        self.lock().checkpoint.clone()
    }

    /// Stores a completed part in slot `part_number - 1` and persists.
    ///
    /// A completed slot is never overwritten.
    pub fn record_part_completion(&self, part: C::Part) -> Result<(), TransferError> {
        let mut inner = self.lock();
        let number = part.part_number();
        let slot = number
            .checked_sub(1)
            .and_then(|i| inner.checkpoint.parts_mut().get_mut(i as usize))
            .ok_or_else(|| TransferError::InvalidState(format!("no checkpoint slot for part {number}")))?;
        if slot.is_completed() {
            return Err(TransferError::InvalidState(format!(
                "part {number} already recorded as complete"
            )));
        }
        *slot = part;
        self.write(&inner)
    }

    /// Rewrites the checkpoint file. A no-op once discarded.
    pub fn persist(&self) -> Result<(), TransferError> {
        let inner = self.lock();
        self.write(&inner)
    }

    /// Stops persisting and removes the file.
    pub fn delete(&self) -> Result<(), TransferError> {
        let mut inner = self.lock();
        inner.discarded = true;
        match &self.path {
            Some(path) => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        }
    }

    /// Like [`CheckpointStore::delete`] but only logs failures.
    pub fn discard(&self) {
        let mut inner = self.lock();
        inner.discarded = true;
        if let Some(path) = &self.path {
            remove_quietly(path);
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.lock().discarded
    }

    fn write(&self, inner: &StoreInner<C>) -> Result<(), TransferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if inner.discarded {
            return Ok(());
        }
        let raw = serde_json::to_vec(&inner.checkpoint)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// First 16 hex characters of SHA-256 over `bucket/key[?versionId=..]`.
pub fn identity_digest(bucket: &str, key: &str, version_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bucket.as_bytes());
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    if !version_id.is_empty() {
        hasher.update(b"?versionId=");
        hasher.update(version_id.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

/// Where the checkpoint of a transfer lives.
///
/// `configured` may name the file itself or a directory to put it in;
/// without it the file goes next to `file`.
pub fn resolve_path(configured: Option<&Path>, file: &Path, digest: &str, suffix: &str) -> PathBuf {
    let base = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{base}.{digest}.{suffix}");
    match configured {
        Some(dir) if dir.is_dir() => dir.join(name),
        Some(explicit) => explicit.to_path_buf(),
        None => file.with_file_name(name),
    }
}
