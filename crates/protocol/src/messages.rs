//! Request and response records exchanged with the transport.

use serde::{Deserialize, Serialize};

use crate::types::{Conditions, ServerSideEncryption};

/// Metadata lookup for one object version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadObjectRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub conditions: Conditions,
    pub sse: ServerSideEncryption,
}

/// Starts a multipart upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateMultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub encoding_type: String,
    pub sse: ServerSideEncryption,
}

/// Uploads one part; the body is passed alongside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// 1-based part number.
    pub part_number: u32,
    pub content_length: u64,
    pub sse: ServerSideEncryption,
}

/// Result of a part upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPartResponse {
    pub part_number: u32,
    pub etag: String,
    /// CRC-64/XZ of the part as computed by the service, 0 if not reported.
    pub crc64: u64,
}

/// Ranged read of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetObjectRangeRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    /// First byte, inclusive.
    pub range_start: u64,
    /// Last byte, inclusive.
    pub range_end: u64,
    pub conditions: Conditions,
    pub sse: ServerSideEncryption,
}

impl GetObjectRangeRequest {
    /// Number of bytes the range covers.
    pub fn range_len(&self) -> u64 {
        self.range_end - self.range_start + 1
    }

    /// Renders the `Range` header value.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.range_start, self.range_end)
    }
}

/// One entry of the completion manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Finalizes a multipart upload with its manifest, ordered by part number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteMultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
}

/// Result of a successful completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteMultipartUploadResponse {
    pub etag: String,
    pub location: String,
    pub version_id: String,
    /// CRC-64/XZ of the assembled object, 0 if not reported.
    pub crc64: u64,
}

/// Cancels a multipart upload and releases its stored parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortMultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}
