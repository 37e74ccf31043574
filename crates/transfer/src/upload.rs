//! Resumable multipart upload of a local file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use partwise_protocol::ProgressEvent;
use partwise_protocol::messages::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CreateMultipartUploadRequest,
    UploadPartRequest,
};
use partwise_protocol::ServerSideEncryption;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::checkpoint::{
    self, Checkpoint, CheckpointStore, UPLOAD_SUFFIX, UploadCheckpoint, UploadIdentity,
    UploadPartInfo,
};
use crate::checksum::crc64_combine_all;
use crate::config::TransferConfig;
use crate::planner::plan_upload_parts;
use crate::retry::{CallContext, StatusCodeClassifier};
use crate::scheduler::Task;
use crate::state::{TransferPhase, TransferState};
use crate::stream::{Direction, ParallelProgress, StreamPipeline};
use crate::task::{EventEmitter, PartContext, run_tasks, settle};
use crate::transport::ObjectTransport;
use crate::types::{PartEventInfo, TransferEventType, UploadFileOutcome, UploadFileRequest};
use crate::validation::validate_object_name;

/// Uploads one part of the file.
pub(crate) struct UploadPartTask {
    ctx: Arc<PartContext>,
    store: Arc<CheckpointStore<UploadCheckpoint>>,
    file_path: PathBuf,
    bucket: String,
    key: String,
    upload_id: String,
    sse: ServerSideEncryption,
    part: UploadPartInfo,
}

impl UploadPartTask {
    fn attempt(&self) -> Result<UploadPartInfo, TransferError> {
        let mut file = File::open(&self.file_path)?;
        file.seek(SeekFrom::Start(self.part.offset))?;
        let mut body = self.ctx.pipeline.wrap(file.take(self.part.part_size));

        let req = UploadPartRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            part_number: self.part.part_number,
            content_length: self.part.part_size,
            sse: self.sse.clone(),
        };
        let sent = self.ctx.transport.upload_part(&req, &mut body);
        let read = body.bytes_read();
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                self.ctx.rewind_progress(read);
                return Err(e.into());
            }
        };

        if read != self.part.part_size {
            self.ctx.rewind_progress(read);
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "part {} sent {read} of {} bytes",
                    self.part.part_number, self.part.part_size
                ),
            )
            .into());
        }

        let crc64 = body.crc64();
        if self.ctx.enable_crc && resp.crc64 != 0 && resp.crc64 != crc64 {
            self.ctx.rewind_progress(read);
            return Err(TransferError::ChecksumMismatch {
                expected: resp.crc64,
                actual: crc64,
            });
        }

        Ok(UploadPartInfo {
            etag: resp.etag,
            crc64,
            is_completed: true,
            ..self.part.clone()
        })
    }
}

fn part_event(part: &UploadPartInfo) -> PartEventInfo {
    PartEventInfo {
        part_number: part.part_number,
        offset: part.offset,
        size: part.part_size,
        etag: part.etag.clone(),
        crc64: part.crc64,
    }
}

impl Task for UploadPartTask {
    type Output = UploadPartInfo;

    fn part_number(&self) -> u32 {
        self.part.part_number
    }

    fn run(&self) -> Result<UploadPartInfo, TransferError> {
        let result = self.ctx.run_attempts(|| self.attempt()).and_then(|done| {
            self.store.record_part_completion(done.clone())?;
            Ok(done)
        });
        match result {
            Ok(done) => {
                debug!(part = done.part_number, size = done.part_size, "part uploaded");
                self.ctx.events.emit(
                    TransferEventType::UploadPartSucceed,
                    Some(part_event(&done)),
                    None,
                );
                Ok(done)
            }
            Err(e) => {
                let kind = self.ctx.failure_kind(
                    TransferEventType::UploadPartFailed,
                    TransferEventType::UploadPartAborted,
                );
                self.ctx.events.emit(kind, Some(part_event(&self.part)), Some(&e));
                Err(e)
            }
        }
    }
}

fn abort_upload(transport: &dyn ObjectTransport, req: &AbortMultipartUploadRequest) {
    match transport.abort_multipart_upload(req) {
        Ok(()) => info!(
            bucket = %req.bucket,
            key = %req.key,
            upload_id = %req.upload_id,
            "multipart upload aborted"
        ),
        Err(e) => warn!(
            bucket = %req.bucket,
            key = %req.key,
            upload_id = %req.upload_id,
            error = %e,
            "failed to abort multipart upload"
        ),
    }
}

fn abort_request(bucket: &str, key: &str, upload_id: &str) -> AbortMultipartUploadRequest {
    AbortMultipartUploadRequest {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id: upload_id.to_string(),
    }
}

/// CRC of the whole object from its parts, `None` if a non-empty part has
/// no recorded checksum.
fn combined_crc(parts: &[UploadPartInfo]) -> Option<u64> {
    if parts.iter().any(|p| p.part_size > 0 && p.crc64 == 0) {
        return None;
    }
    Some(crc64_combine_all(parts.iter().map(|p| (p.crc64, p.part_size))))
}

/// Uploads `req.file_path` as a multipart object, resuming from a valid
/// checkpoint when enabled.
pub fn upload_file(
    transport: &Arc<dyn ObjectTransport>,
    config: &TransferConfig,
    req: UploadFileRequest,
) -> Result<UploadFileOutcome, TransferError> {
    validate_object_name(&req.bucket, &req.key)?;
    let meta = std::fs::metadata(&req.file_path)?;
    if !meta.is_file() {
        return Err(TransferError::invalid(format!(
            "not a regular file: {}",
            req.file_path.display()
        )));
    }
    let file_size = meta.len();
    let file_mtime = DateTime::<Utc>::from(meta.modified()?).timestamp();

    let part_size = req.part_size.unwrap_or(config.part_size);
    let plan = plan_upload_parts(file_size, part_size, &config.part_limits)?;
    let mut state = TransferState::new(format!("{}/{}", req.bucket, req.key));
    info!(
        bucket = %req.bucket,
        key = %req.key,
        file = %req.file_path.display(),
        size = file_size,
        parts = plan.len(),
        "upload started"
    );

    let identity = UploadIdentity {
        bucket: req.bucket.clone(),
        key: req.key.clone(),
        part_size,
        encoding_type: req.encoding_type.clone(),
        file_path: req.file_path.to_string_lossy().into_owned(),
        file_size,
        file_mtime,
        ..Default::default()
    }
    .with_sse(&req.sse);

    let checkpoint_path = req.enable_checkpoint.then(|| {
        checkpoint::resolve_path(
            req.checkpoint_path
                .as_deref()
                .or(config.checkpoint_dir.as_deref()),
            &req.file_path,
            &checkpoint::identity_digest(&req.bucket, &req.key, ""),
            UPLOAD_SUFFIX,
        )
    });

    let mut call = CallContext::new();
    let cancel = req.cancel.clone().unwrap_or_default();
    call = call.with_cancel(cancel.token());
    if let Some(timeout) = req.timeout {
        call = call.with_timeout(timeout);
    }
    let retry = config.retry_policy();
    let events = EventEmitter::new(req.events.clone(), &req.bucket, &req.key)
        .with_checkpoint(checkpoint_path.clone());

    let previous = match &checkpoint_path {
        Some(path) => checkpoint::load::<UploadCheckpoint>(path)?,
        None => None,
    };
    let (checkpoint, fresh) = match previous {
        Some(cp) if cp.is_valid_for(&identity, plan.len()) => {
            state.advance(TransferPhase::Resuming)?;
            info!(
                upload_id = %cp.upload_id,
                completed = cp.parts_info.iter().filter(|p| p.is_completed).count(),
                "resuming upload from checkpoint"
            );
            (cp, false)
        }
        stale => {
            if let Some(stale) = stale {
                warn!(upload_id = %stale.upload_id, "checkpoint does not match, starting over");
                if !stale.upload_id.is_empty() {
                    abort_upload(
                        transport.as_ref(),
                        &abort_request(&stale.bucket, &stale.key, &stale.upload_id),
                    );
                }
                if let Some(path) = &checkpoint_path {
                    checkpoint::remove_quietly(path);
                }
            }
            state.advance(TransferPhase::Fresh)?;

            let create = CreateMultipartUploadRequest {
                bucket: req.bucket.clone(),
                key: req.key.clone(),
                encoding_type: req.encoding_type.clone(),
                sse: req.sse.clone(),
            };
            let created = retry
                .run(
                    &call,
                    |_| transport.create_multipart_upload(&create).map_err(TransferError::from),
                    &StatusCodeClassifier,
                )
                .and_then(|id| {
                    if id.is_empty() {
                        Err(TransferError::InvalidState(
                            "service returned an empty upload id".into(),
                        ))
                    } else {
                        Ok(id)
                    }
                });
            let upload_id = match created {
                Ok(id) => {
                    events.clone().with_upload_id(&id).emit(
                        TransferEventType::CreateMultipartUploadSucceed,
                        None,
                        None,
                    );
                    id
                }
                Err(e) => {
                    events.emit(TransferEventType::CreateMultipartUploadFailed, None, Some(&e));
                    state.fail();
                    return Err(e);
                }
            };
            debug!(upload_id = %upload_id, "multipart upload created");
            (UploadCheckpoint::create(&identity, &upload_id, &plan), true)
        }
    };

    let upload_id = checkpoint.upload_id.clone();
    let events = events.with_upload_id(&upload_id);
    let store = Arc::new(CheckpointStore::new(checkpoint, checkpoint_path));
    if fresh {
        if let Err(e) = store.persist() {
            abort_upload(
                transport.as_ref(),
                &abort_request(&req.bucket, &req.key, &upload_id),
            );
            state.fail();
            return Err(e);
        }
    }

    {
        let store = Arc::clone(&store);
        cancel.set_cleaner(move || store.discard());
    }
    {
        let transport = Arc::clone(transport);
        let abort = abort_request(&req.bucket, &req.key, &upload_id);
        cancel.set_aborter(move || abort_upload(transport.as_ref(), &abort));
    }

    let snapshot = store.snapshot();
    let pending: Vec<UploadPartInfo> = snapshot
        .parts_info
        .iter()
        .filter(|p| !p.is_completed)
        .cloned()
        .collect();
    let resumed_parts = snapshot.parts_info.len() - pending.len();

    let progress = req.progress.clone().map(|listener| {
        listener(ProgressEvent::Started);
        Arc::new(ParallelProgress::new(
            listener,
            file_size,
            snapshot.completed_bytes(),
        ))
    });
    let limiter = req.rate_limiter.clone().or_else(|| config.rate_limiter());
    let ctx = Arc::new(PartContext {
        transport: Arc::clone(transport),
        retry,
        call,
        cancel: cancel.clone(),
        pipeline: StreamPipeline::new(Direction::Upload)
            .with_limiter(limiter)
            .with_progress(progress.clone()),
        events: events.clone(),
        enable_crc: config.enable_crc,
    });

    state.advance(TransferPhase::Scheduling)?;
    let tasks: Vec<UploadPartTask> = pending
        .into_iter()
        .map(|part| UploadPartTask {
            ctx: Arc::clone(&ctx),
            store: Arc::clone(&store),
            file_path: req.file_path.clone(),
            bucket: req.bucket.clone(),
            key: req.key.clone(),
            upload_id: upload_id.clone(),
            sse: req.sse.clone(),
            part,
        })
        .collect();
    let task_num = req.task_num.unwrap_or(config.task_num);
    state.advance(TransferPhase::PartsInFlight)?;
    let outcome = run_tasks(tasks, task_num, &cancel)?;
    let kept = store
        .path()
        .filter(|_| !store.is_discarded())
        .map(|p| p.to_path_buf());
    settle(outcome, &cancel, kept.clone(), &mut state)?;

    state.advance(TransferPhase::AllPartsComplete)?;
    state.advance(TransferPhase::Finalizing)?;
    let finished = store.snapshot();
    let complete = CompleteMultipartUploadRequest {
        bucket: req.bucket.clone(),
        key: req.key.clone(),
        upload_id: upload_id.clone(),
        parts: finished.completed_parts(),
    };
    let resp = match transport.complete_multipart_upload(&complete) {
        Ok(resp) => {
            events.emit(TransferEventType::CompleteMultipartUploadSucceed, None, None);
            resp
        }
        Err(e) => {
            let e = TransferError::from(e);
            events.emit(
                TransferEventType::CompleteMultipartUploadFailed,
                None,
                Some(&e),
            );
            state.fail();
            return Err(TransferError::FinalizeFailed {
                operation: "complete multipart upload",
                source: Box::new(e),
                checkpoint: kept,
            });
        }
    };

    let local_crc = combined_crc(&finished.parts_info);
    if config.enable_crc && resp.crc64 != 0 {
        match local_crc {
            Some(actual) if actual != resp.crc64 => {
                store.discard();
                state.fail();
                return Err(TransferError::ChecksumMismatch {
                    expected: resp.crc64,
                    actual,
                });
            }
            Some(_) => {}
            None => debug!("part checksums missing, skipping object checksum check"),
        }
    }

    if let Some(progress) = &progress {
        progress.complete();
    }
    if let Err(e) = store.delete() {
        warn!(error = %e, "failed to delete checkpoint after upload");
    }
    state.advance(TransferPhase::Done)?;
    info!(
        bucket = %req.bucket,
        key = %req.key,
        upload_id = %upload_id,
        resumed_parts,
        "upload finished"
    );

    Ok(UploadFileOutcome {
        bucket: req.bucket,
        key: req.key,
        upload_id,
        etag: resp.etag,
        location: resp.location,
        version_id: resp.version_id,
        crc64: if resp.crc64 != 0 {
            resp.crc64
        } else {
            local_crc.unwrap_or(0)
        },
        resumed_parts,
    })
}
