//! Splits an object into parts.

use partwise_protocol::constants::{MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE};
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Protocol bounds on part size and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_part_count: u64,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            max_part_count: MAX_PART_COUNT,
        }
    }
}

impl PartLimits {
    pub fn check_part_size(&self, part_size: u64) -> Result<(), TransferError> {
        if part_size < self.min_part_size || part_size > self.max_part_size {
            return Err(TransferError::invalid(format!(
                "part size {part_size} outside [{}, {}]",
                self.min_part_size, self.max_part_size
            )));
        }
        Ok(())
    }
}

/// One planned part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// 1-based.
    pub part_number: u32,
    pub offset: u64,
    pub size: u64,
}

impl PartPlan {
    /// Last byte of the part, inclusive. Meaningless for an empty part.
    pub fn range_end(&self) -> u64 {
        (self.offset + self.size).saturating_sub(1)
    }
}

/// Number of parts `total` bytes split into with `part_size`.
pub fn part_count(total: u64, part_size: u64) -> u64 {
    total.div_ceil(part_size.max(1))
}

/// Plans `ceil(total / part_size)` parts; the last one takes the remainder.
///
/// Zero bytes plan zero parts.
pub fn plan_parts(
    total: u64,
    part_size: u64,
    limits: &PartLimits,
) -> Result<Vec<PartPlan>, TransferError> {
    limits.check_part_size(part_size)?;
    let count = part_count(total, part_size);
    if count > limits.max_part_count {
        return Err(TransferError::invalid(format!(
            "{total} bytes at part size {part_size} need {count} parts, more than {}",
            limits.max_part_count
        )));
    }

    Ok((0..count)
        .map(|i| {
            let offset = i * part_size;
            PartPlan {
                part_number: (i + 1) as u32,
                offset,
                size: part_size.min(total - offset),
            }
        })
        .collect())
}

/// Like [`plan_parts`], but an empty file still gets one empty part so the
/// completion manifest is never empty.
pub fn plan_upload_parts(
    total: u64,
    part_size: u64,
    limits: &PartLimits,
) -> Result<Vec<PartPlan>, TransferError> {
    let mut parts = plan_parts(total, part_size, limits)?;
    if parts.is_empty() {
        parts.push(PartPlan {
            part_number: 1,
            offset: 0,
            size: 0,
        });
    }
    Ok(parts)
}
