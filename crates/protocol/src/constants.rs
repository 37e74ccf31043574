//! Protocol-imposed limits and defaults.

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Smallest accepted part size (the final part may be smaller).
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Largest accepted part size.
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// Maximum number of parts in one multipart upload.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Part size used when the caller does not provide one.
pub const DEFAULT_PART_SIZE: u64 = 20 * MIB;

/// Upper bound on concurrent part workers.
pub const MAX_TASK_NUM: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_ordered() {
        assert!(MIN_PART_SIZE < DEFAULT_PART_SIZE);
        assert!(DEFAULT_PART_SIZE < MAX_PART_SIZE);
        assert_eq!(MIN_PART_SIZE, 5_242_880);
    }
}
