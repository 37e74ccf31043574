use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote object metadata as reported by a metadata (HEAD) request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub etag: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// CRC-64/XZ of the whole object, 0 when the service did not report one.
    #[serde(default)]
    pub crc64: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version_id: String,
}

/// Conditional-request preconditions attached to reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub if_match: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub if_none_match: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Conditions {
    /// Returns `true` if no precondition is set.
    pub fn is_empty(&self) -> bool {
        self.if_match.is_empty()
            && self.if_modified_since.is_none()
            && self.if_none_match.is_empty()
            && self.if_unmodified_since.is_none()
    }
}

/// Server-side encryption parameters.
///
/// `customer_key` is the raw SSE-C key. It is sent with every request but
/// never persisted; checkpoints record only the algorithm and key digest.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ServerSideEncryption {
    /// SSE-C algorithm, e.g. `AES256`.
    pub customer_algorithm: String,
    /// Base64 SSE-C key.
    pub customer_key: String,
    /// Base64 MD5 of the SSE-C key.
    pub customer_key_md5: String,
    /// Service-managed encryption, e.g. `AES256` or `kms`.
    pub server_side_encryption: String,
}

impl fmt::Debug for ServerSideEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSideEncryption")
            .field("customer_algorithm", &self.customer_algorithm)
            .field(
                "customer_key",
                &if self.customer_key.is_empty() { "" } else { "<redacted>" },
            )
            .field("customer_key_md5", &self.customer_key_md5)
            .field("server_side_encryption", &self.server_side_encryption)
            .finish()
    }
}
