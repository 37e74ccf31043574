//! Resumable ranged download of an object into a local file.
//!
//! Parts are written into `<target>.temp` at their offsets. The temp file
//! is renamed onto the target once every part is in and the object
//! checksum matches.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use partwise_protocol::messages::{GetObjectRangeRequest, HeadObjectRequest};
use partwise_protocol::{Conditions, ObjectMeta, ProgressEvent, TransportError};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::checkpoint::{
    self, Checkpoint, CheckpointStore, DOWNLOAD_SUFFIX, DownloadCheckpoint, DownloadIdentity,
    DownloadPartInfo, PartRecord,
};
use crate::checksum::{crc64_combine_all, crc64_file};
use crate::config::TransferConfig;
use crate::planner::plan_parts;
use crate::retry::{CallContext, StatusCodeClassifier};
use crate::scheduler::Task;
use crate::state::{TransferPhase, TransferState};
use crate::stream::{Direction, ParallelProgress, StreamPipeline};
use crate::task::{EventEmitter, PartContext, run_tasks, settle};
use crate::transport::ObjectTransport;
use crate::types::{DownloadFileOutcome, DownloadFileRequest, PartEventInfo, TransferEventType};
use crate::validation::{resolve_download_target, validate_object_name};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Fetches one range of the object into the temp file.
pub(crate) struct DownloadPartTask {
    ctx: Arc<PartContext>,
    store: Arc<CheckpointStore<DownloadCheckpoint>>,
    temp_path: PathBuf,
    request: GetObjectRangeRequest,
    part: DownloadPartInfo,
}

/// Copies exactly `expected` bytes from `src` into `dst`.
///
/// Errors reading `src` come from the connection and are reported as
/// network errors so they are retried. Errors writing `dst` stay I/O errors.
fn copy_range(src: &mut impl Read, dst: &mut File, expected: u64) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransportError::Network(format!("reading range body: {e}")).into());
            }
        };
        if written + n as u64 > expected {
            return Err(TransportError::Network(format!(
                "range body longer than {expected} bytes"
            ))
            .into());
        }
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }
    if written != expected {
        return Err(TransportError::Network(format!(
            "range body ended after {written} of {expected} bytes"
        ))
        .into());
    }
    Ok(written)
}

impl DownloadPartTask {
    fn attempt(&self) -> Result<DownloadPartInfo, TransferError> {
        let body = self.ctx.transport.get_object_range(&self.request)?;
        let mut stream = self.ctx.pipeline.wrap(body);

        let mut file = OpenOptions::new().write(true).open(&self.temp_path)?;
        file.seek(SeekFrom::Start(self.part.range_start))?;
        if let Err(e) = copy_range(&mut stream, &mut file, self.request.range_len()) {
            self.ctx.rewind_progress(stream.bytes_read());
            return Err(e);
        }
        file.flush()?;

        Ok(DownloadPartInfo {
            crc64: stream.crc64(),
            is_completed: true,
            ..self.part.clone()
        })
    }
}

fn part_event(part: &DownloadPartInfo) -> PartEventInfo {
    PartEventInfo {
        part_number: part.part_number,
        offset: part.range_start,
        size: part.size(),
        etag: String::new(),
        crc64: part.crc64,
    }
}

impl Task for DownloadPartTask {
    type Output = DownloadPartInfo;

    fn part_number(&self) -> u32 {
        self.part.part_number
    }

    fn run(&self) -> Result<DownloadPartInfo, TransferError> {
        let result = self.ctx.run_attempts(|| self.attempt()).and_then(|done| {
            self.store.record_part_completion(done.clone())?;
            Ok(done)
        });
        match result {
            Ok(done) => {
                debug!(part = done.part_number, start = done.range_start, "part downloaded");
                self.ctx.events.emit(
                    TransferEventType::DownloadPartSucceed,
                    Some(part_event(&done)),
                    None,
                );
                Ok(done)
            }
            Err(e) => {
                let kind = self.ctx.failure_kind(
                    TransferEventType::DownloadPartFailed,
                    TransferEventType::DownloadPartAborted,
                );
                self.ctx.events.emit(kind, Some(part_event(&self.part)), Some(&e));
                Err(e)
            }
        }
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".temp");
    PathBuf::from(name)
}

fn create_temp_file(path: &Path, size: u64) -> Result<(), TransferError> {
    let file = File::create(path)?;
    file.set_len(size)?;
    Ok(())
}

fn temp_file_intact(path: &Path, size: u64) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == size)
}

/// CRC of the downloaded bytes. Parts resumed without a recorded checksum
/// force a pass over the whole file.
fn local_crc(parts: &[DownloadPartInfo], temp_path: &Path) -> Result<u64, TransferError> {
    if parts.iter().any(|p| p.size() > 0 && p.crc64 == 0) {
        debug!(path = %temp_path.display(), "part checksums missing, hashing temp file");
        return crc64_file(temp_path);
    }
    Ok(crc64_combine_all(parts.iter().map(|p| (p.crc64, p.size()))))
}

/// Downloads an object into `req.file_path`, resuming from a valid
/// checkpoint and temp file when enabled.
pub fn download_file(
    transport: &Arc<dyn ObjectTransport>,
    config: &TransferConfig,
    req: DownloadFileRequest,
) -> Result<DownloadFileOutcome, TransferError> {
    validate_object_name(&req.bucket, &req.key)?;
    let target = resolve_download_target(&req.file_path, &req.key)?;
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = temp_path_for(&target);
    let mut state = TransferState::new(format!("{}/{}", req.bucket, req.key));

    let mut call = CallContext::new();
    let cancel = req.cancel.clone().unwrap_or_default();
    call = call.with_cancel(cancel.token());
    if let Some(timeout) = req.timeout {
        call = call.with_timeout(timeout);
    }
    let retry = config.retry_policy();

    let head = HeadObjectRequest {
        bucket: req.bucket.clone(),
        key: req.key.clone(),
        version_id: req.version_id.clone(),
        conditions: req.conditions.clone(),
        sse: req.sse.clone(),
    };
    let meta: ObjectMeta = match retry.run(
        &call,
        |_| transport.head_object(&head).map_err(TransferError::from),
        &StatusCodeClassifier,
    ) {
        Ok(meta) => meta,
        Err(e) => {
            state.fail();
            return Err(e);
        }
    };

    let part_size = req.part_size.unwrap_or(config.part_size);
    let plan = plan_parts(meta.size, part_size, &config.part_limits)?;
    info!(
        bucket = %req.bucket,
        key = %req.key,
        file = %target.display(),
        size = meta.size,
        parts = plan.len(),
        "download started"
    );

    let identity = DownloadIdentity {
        bucket: req.bucket.clone(),
        key: req.key.clone(),
        version_id: req.version_id.clone(),
        part_size,
        conditions: req.conditions.clone(),
        file_path: target.to_string_lossy().into_owned(),
        ..Default::default()
    }
    .with_sse(&req.sse);

    let checkpoint_path = req.enable_checkpoint.then(|| {
        checkpoint::resolve_path(
            req.checkpoint_path
                .as_deref()
                .or(config.checkpoint_dir.as_deref()),
            &target,
            &checkpoint::identity_digest(&req.bucket, &req.key, &req.version_id),
            DOWNLOAD_SUFFIX,
        )
    });
    let events = EventEmitter::new(req.events.clone(), &req.bucket, &req.key)
        .with_checkpoint(checkpoint_path.clone());
    let temp_name = temp_path.to_string_lossy().into_owned();

    let previous = match &checkpoint_path {
        Some(path) => checkpoint::load::<DownloadCheckpoint>(path)?,
        None => None,
    };
    let (checkpoint, fresh) = match previous {
        Some(cp)
            if cp.is_valid_for(&identity, &meta, plan.len())
                && cp.file_info.temp_file_path == temp_name
                && temp_file_intact(&temp_path, meta.size) =>
        {
            state.advance(TransferPhase::Resuming)?;
            info!(
                completed = cp.parts_info.iter().filter(|p| p.is_completed).count(),
                "resuming download from checkpoint"
            );
            (cp, false)
        }
        stale => {
            if stale.is_some() {
                warn!(key = %req.key, "checkpoint does not match, starting over");
                if let Some(path) = &checkpoint_path {
                    checkpoint::remove_quietly(path);
                }
            }
            state.advance(TransferPhase::Fresh)?;
            match create_temp_file(&temp_path, meta.size) {
                Ok(()) => events.emit(TransferEventType::CreateTempFileSucceed, None, None),
                Err(e) => {
                    events.emit(TransferEventType::CreateTempFileFailed, None, Some(&e));
                    state.fail();
                    return Err(e);
                }
            }
            (
                DownloadCheckpoint::create(&identity, &meta, &temp_name, &plan),
                true,
            )
        }
    };

    let store = Arc::new(CheckpointStore::new(checkpoint, checkpoint_path));
    if fresh {
        if let Err(e) = store.persist() {
            checkpoint::remove_quietly(&temp_path);
            state.fail();
            return Err(e);
        }
    }

    {
        let store = Arc::clone(&store);
        let temp_path = temp_path.clone();
        cancel.set_cleaner(move || {
            store.discard();
            checkpoint::remove_quietly(&temp_path);
        });
    }

    let snapshot = store.snapshot();
    // The recorded ETag pins every range to the object that was planned.
    let range_conditions = if req.conditions.if_match.is_empty() {
        Conditions {
            if_match: snapshot.object_info.etag.clone(),
            ..req.conditions.clone()
        }
    } else {
        req.conditions.clone()
    };
    let pending: Vec<DownloadPartInfo> = snapshot
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
            meta.size,
            snapshot.completed_bytes(),
        ))
    });
    let limiter = req.rate_limiter.clone().or_else(|| config.rate_limiter());
    let ctx = Arc::new(PartContext {
        transport: Arc::clone(transport),
        retry,
        call,
        cancel: cancel.clone(),
        pipeline: StreamPipeline::new(Direction::Download)
            .with_limiter(limiter)
            .with_progress(progress.clone()),
        events: events.clone(),
        enable_crc: config.enable_crc,
    });

    state.advance(TransferPhase::Scheduling)?;
    let tasks: Vec<DownloadPartTask> = pending
        .into_iter()
        .map(|part| DownloadPartTask {
            ctx: Arc::clone(&ctx),
            store: Arc::clone(&store),
            temp_path: temp_path.clone(),
            request: GetObjectRangeRequest {
                bucket: req.bucket.clone(),
                key: req.key.clone(),
                version_id: req.version_id.clone(),
                range_start: part.range_start,
                range_end: part.range_end,
                conditions: range_conditions.clone(),
                sse: req.sse.clone(),
            },
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
    let crc64 = local_crc(&finished.parts_info, &temp_path)?;
    if config.enable_crc && meta.crc64 != 0 && crc64 != meta.crc64 {
        warn!(
            key = %req.key,
            expected = meta.crc64,
            actual = crc64,
            "downloaded object checksum mismatch"
        );
        store.discard();
        checkpoint::remove_quietly(&temp_path);
        state.fail();
        return Err(TransferError::ChecksumMismatch {
            expected: meta.crc64,
            actual: crc64,
        });
    }

    if let Err(e) = std::fs::rename(&temp_path, &target) {
        let e = TransferError::from(e);
        events.emit(TransferEventType::RenameTempFileFailed, None, Some(&e));
        state.fail();
        return Err(TransferError::FinalizeFailed {
            operation: "rename temp file",
            source: Box::new(e),
            checkpoint: kept,
        });
    }
    events.emit(TransferEventType::RenameTempFileSucceed, None, None);

    if let Some(progress) = &progress {
        progress.complete();
    }
    if let Err(e) = store.delete() {
        warn!(error = %e, "failed to delete checkpoint after download");
    }
    state.advance(TransferPhase::Done)?;
    info!(
        bucket = %req.bucket,
        key = %req.key,
        file = %target.display(),
        resumed_parts,
        "download finished"
    );

    Ok(DownloadFileOutcome {
        bucket: req.bucket,
        key: req.key,
        version_id: if req.version_id.is_empty() {
            meta.version_id
        } else {
            req.version_id
        },
        file_path: target,
        etag: meta.etag,
        size: meta.size,
        crc64,
        resumed_parts,
    })
}
