//! Object-store operations the engine drives.
//!
//! Implemented by the client that owns signing and HTTP. Calls are blocking:
//! they run on scheduler workers, and the client applies its own per-call
//! timeouts.

use std::io::Read;

use partwise_protocol::messages::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CreateMultipartUploadRequest, GetObjectRangeRequest, HeadObjectRequest, UploadPartRequest,
    UploadPartResponse,
};
use partwise_protocol::{ObjectMeta, TransportError};

pub trait ObjectTransport: Send + Sync {
    /// Fetches the metadata of one object version.
    fn head_object(&self, req: &HeadObjectRequest) -> Result<ObjectMeta, TransportError>;

    /// Starts a multipart upload and returns its upload id.
    fn create_multipart_upload(
        &self,
        req: &CreateMultipartUploadRequest,
    ) -> Result<String, TransportError>;

    /// Sends one part. `body` yields exactly `req.content_length` bytes.
    fn upload_part(
        &self,
        req: &UploadPartRequest,
        body: &mut dyn Read,
    ) -> Result<UploadPartResponse, TransportError>;

    /// Opens a ranged read of an object.
    fn get_object_range(
        &self,
        req: &GetObjectRangeRequest,
    ) -> Result<Box<dyn Read + Send>, TransportError>;

    /// Assembles the uploaded parts into the final object.
    fn complete_multipart_upload(
        &self,
        req: &CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse, TransportError>;

    /// Cancels a multipart upload and drops its stored parts.
    fn abort_multipart_upload(&self, req: &AbortMultipartUploadRequest)
    -> Result<(), TransportError>;
}
