//! In-memory object service for the engine tests.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use partwise_protocol::messages::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CreateMultipartUploadRequest, GetObjectRangeRequest, HeadObjectRequest, UploadPartRequest,
    UploadPartResponse,
};
use partwise_protocol::{ObjectMeta, ProgressEvent, ProgressListener, TransportError};

use crate::checksum::crc64_bytes;
use crate::config::TransferConfig;
use crate::planner::PartLimits;
use crate::transport::ObjectTransport;
use crate::types::{EventListener, TransferEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Head,
    Create,
    UploadPart,
    GetRange,
    Complete,
    Abort,
}

struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
    reported_crc: Option<u64>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

struct Failure {
    error: TransportError,
    remaining: usize,
}

type Hook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct MockState {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    serial: u64,
    failures: HashMap<(Op, u64), Failure>,
    short_reads: HashMap<u64, usize>,
    calls: HashMap<Op, usize>,
    uploaded_parts: Vec<u32>,
    fetched_ranges: Vec<u64>,
    aborted: Vec<String>,
    completed: Vec<CompleteMultipartUploadRequest>,
    corrupt_part_crc: bool,
    rejected_bodies: HashMap<u32, Failure>,
}

impl MockState {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    /// Counts the call and returns an injected failure, if one is armed.
    fn enter(&mut self, op: Op, key: u64) -> Result<(), TransportError> {
        *self.calls.entry(op).or_default() += 1;
        let Some(failure) = self.failures.get_mut(&(op, key)) else {
            return Ok(());
        };
        let error = failure.error.clone();
        failure.remaining = failure.remaining.saturating_sub(1);
        if failure.remaining == 0 {
            self.failures.remove(&(op, key));
        }
        Err(error)
    }

    fn reject_body(&mut self, part: u32) -> Result<(), TransportError> {
        let Some(failure) = self.rejected_bodies.get_mut(&part) else {
            return Ok(());
        };
        let error = failure.error.clone();
        failure.remaining = failure.remaining.saturating_sub(1);
        if failure.remaining == 0 {
            self.rejected_bodies.remove(&part);
        }
        Err(error)
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
    upload_hook: Mutex<Option<Hook>>,
    range_hook: Mutex<Option<Hook>>,
}

fn not_found(what: &str) -> TransportError {
    TransportError::server(404, format!("{what} not found"))
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hook(slot: &Mutex<Option<Hook>>) -> Option<Hook> {
        slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn put_object(&self, bucket: &str, key: &str, data: &[u8]) {
        let mut state = self.state();
        let serial = state.next_serial();
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                etag: format!("\"obj-{serial}\""),
                last_modified: Utc.timestamp_opt(1_700_000_000 + serial as i64, 0).unwrap(),
                reported_crc: None,
            },
        );
    }

    pub(crate) fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub(crate) fn etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.etag.clone())
    }

    pub(crate) fn set_reported_crc(&self, bucket: &str, key: &str, crc: u64) {
        if let Some(o) = self
            .state()
            .objects
            .get_mut(&(bucket.to_string(), key.to_string()))
        {
            o.reported_crc = Some(crc);
        }
    }

    /// Fails `op` for `key` the next `times` calls. `key` is the part number
    /// for uploads, the range start for ranged reads and 0 otherwise.
    pub(crate) fn fail(&self, op: Op, key: u64, error: TransportError, times: usize) {
        self.state().failures.insert(
            (op, key),
            Failure {
                error,
                remaining: times,
            },
        );
    }

    pub(crate) fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Truncates the body of the range starting at `start` the next `times`
    /// reads.
    pub(crate) fn short_reads(&self, start: u64, times: usize) {
        self.state().short_reads.insert(start, times);
    }

    /// Fails the next `times` uploads of `part` after its body was consumed.
    pub(crate) fn reject_body(&self, part: u32, error: TransportError, times: usize) {
        self.state().rejected_bodies.insert(
            part,
            Failure {
                error,
                remaining: times,
            },
        );
    }

    pub(crate) fn corrupt_part_crc(&self, on: bool) {
        self.state().corrupt_part_crc = on;
    }

    pub(crate) fn on_upload_part(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        let hook: Hook = Arc::new(move |n| hook(n as u32));
        *self.upload_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub(crate) fn on_get_range(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.range_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub(crate) fn clear_hooks(&self) {
        *self.upload_hook.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.range_hook.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Forgets call counts and the part and range logs.
    pub(crate) fn clear_log(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.uploaded_parts.clear();
        state.fetched_ranges.clear();
    }

    pub(crate) fn calls(&self, op: Op) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Part numbers stored, in arrival order.
    pub(crate) fn uploaded_parts(&self) -> Vec<u32> {
        self.state().uploaded_parts.clone()
    }

    /// Range starts served, in arrival order.
    pub(crate) fn fetched_ranges(&self) -> Vec<u64> {
        self.state().fetched_ranges.clone()
    }

    pub(crate) fn aborted(&self) -> Vec<String> {
        self.state().aborted.clone()
    }

    pub(crate) fn completed(&self) -> Vec<CompleteMultipartUploadRequest> {
        self.state().completed.clone()
    }
}

impl ObjectTransport for MockTransport {
    fn head_object(&self, req: &HeadObjectRequest) -> Result<ObjectMeta, TransportError> {
        let mut state = self.state();
        state.enter(Op::Head, 0)?;
        let object = state
            .objects
            .get(&(req.bucket.clone(), req.key.clone()))
            .ok_or_else(|| not_found("object"))?;
        Ok(ObjectMeta {
            etag: object.etag.clone(),
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
            crc64: object
                .reported_crc
                .unwrap_or_else(|| crc64_bytes(&object.data)),
            version_id: String::new(),
        })
    }

    fn create_multipart_upload(
        &self,
        req: &CreateMultipartUploadRequest,
    ) -> Result<String, TransportError> {
        let mut state = self.state();
        state.enter(Op::Create, 0)?;
        let id = format!("upload-{}", state.next_serial());
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                bucket: req.bucket.clone(),
                key: req.key.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn upload_part(
        &self,
        req: &UploadPartRequest,
        body: &mut dyn Read,
    ) -> Result<UploadPartResponse, TransportError> {
        if let Some(hook) = Self::hook(&self.upload_hook) {
            hook(u64::from(req.part_number));
        }
        {
            let mut state = self.state();
            state.enter(Op::UploadPart, u64::from(req.part_number))?;
            if !state.uploads.contains_key(&req.upload_id) {
                return Err(not_found("upload"));
            }
        }

        let mut data = Vec::new();
        body.take(req.content_length)
            .read_to_end(&mut data)
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let mut state = self.state();
        state.reject_body(req.part_number)?;
        let corrupt = state.corrupt_part_crc;
        let upload = state
            .uploads
            .get_mut(&req.upload_id)
            .ok_or_else(|| not_found("upload"))?;
        let crc = crc64_bytes(&data);
        let etag = format!("\"part-{}-{crc:016x}\"", req.part_number);
        upload.parts.insert(req.part_number, (etag.clone(), data));
        state.uploaded_parts.push(req.part_number);
        Ok(UploadPartResponse {
            part_number: req.part_number,
            etag,
            crc64: if corrupt { crc ^ 1 } else { crc },
        })
    }

    fn get_object_range(
        &self,
        req: &GetObjectRangeRequest,
    ) -> Result<Box<dyn Read + Send>, TransportError> {
        if let Some(hook) = Self::hook(&self.range_hook) {
            hook(req.range_start);
        }
        let mut state = self.state();
        state.enter(Op::GetRange, req.range_start)?;
        let object = state
            .objects
            .get(&(req.bucket.clone(), req.key.clone()))
            .ok_or_else(|| not_found("object"))?;
        if !req.conditions.if_match.is_empty() && req.conditions.if_match != object.etag {
            return Err(TransportError::server(412, "precondition failed"));
        }
        let len = object.data.len() as u64;
        if req.range_start > req.range_end || req.range_end >= len {
            return Err(TransportError::server(416, "range not satisfiable"));
        }
        let mut slice =
            object.data[req.range_start as usize..=req.range_end as usize].to_vec();
        state.fetched_ranges.push(req.range_start);
        if let Some(left) = state.short_reads.get_mut(&req.range_start) {
            if *left > 0 {
                *left -= 1;
                slice.truncate(slice.len() / 2);
            }
        }
        Ok(Box::new(Cursor::new(slice)))
    }

    fn complete_multipart_upload(
        &self,
        req: &CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse, TransportError> {
        let mut state = self.state();
        state.enter(Op::Complete, 0)?;
        let upload = state
            .uploads
            .get(&req.upload_id)
            .ok_or_else(|| not_found("upload"))?;
        let mut data = Vec::new();
        for part in &req.parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(TransportError::server(
                        400,
                        format!("invalid part {}", part.part_number),
                    ));
                }
            }
        }
        let (bucket, key) = (upload.bucket.clone(), upload.key.clone());
        state.uploads.remove(&req.upload_id);

        let crc64 = crc64_bytes(&data);
        let serial = state.next_serial();
        let etag = format!("\"obj-{serial}\"");
        state.objects.insert(
            (bucket.clone(), key.clone()),
            StoredObject {
                data,
                etag: etag.clone(),
                last_modified: Utc.timestamp_opt(1_700_000_000 + serial as i64, 0).unwrap(),
                reported_crc: None,
            },
        );
        state.completed.push(req.clone());
        Ok(CompleteMultipartUploadResponse {
            etag,
            location: format!("https://{bucket}.mock/{key}"),
            version_id: String::new(),
            crc64,
        })
    }

    fn abort_multipart_upload(&self, req: &AbortMultipartUploadRequest) -> Result<(), TransportError> {
        let mut state = self.state();
        state.enter(Op::Abort, 0)?;
        state
            .uploads
            .remove(&req.upload_id)
            .ok_or_else(|| not_found("upload"))?;
        state.aborted.push(req.upload_id.clone());
        Ok(())
    }
}

/// Config with tiny parts allowed and near-instant retries.
pub(crate) fn test_config() -> TransferConfig {
    TransferConfig {
        part_limits: PartLimits {
            min_part_size: 1,
            ..Default::default()
        },
        retry_base_ms: 1,
        jitter: 0.0,
        ..Default::default()
    }
}

pub(crate) fn collect_progress() -> (ProgressListener, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: ProgressListener = Arc::new(move |e: ProgressEvent| {
        sink.lock().unwrap().push(e);
    });
    (listener, events)
}

pub(crate) fn collect_events() -> (EventListener, Arc<Mutex<Vec<TransferEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: EventListener = Arc::new(move |e: &TransferEvent| {
        sink.lock().unwrap().push(e.clone());
    });
    (listener, events)
}
