use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Rejects an empty bucket or key.
pub fn validate_object_name(bucket: &str, key: &str) -> Result<(), TransferError> {
    if bucket.is_empty() {
        return Err(TransferError::invalid("empty bucket name"));
    }
    if key.is_empty() {
        return Err(TransferError::invalid("empty object key"));
    }
    Ok(())
}

/// Local file name for an object key: its last `/` segment.
///
/// Rejects keys whose last segment is empty or would step outside the
/// target directory (`.`, `..`, absolute or prefixed paths).
pub fn file_name_for_key(key: &str) -> Result<&str, TransferError> {
    let name = key.rsplit('/').next().unwrap_or(key);
    if name.is_empty() {
        return Err(TransferError::invalid(format!(
            "object key has no file name: {key}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(TransferError::invalid(format!(
            "object key does not map to a file name: {key}"
        ))),
    }
}

/// Resolves where a download lands.
///
/// A target that is an existing directory, or whose text ends with a path
/// separator, gets [`file_name_for_key`] appended.
pub fn resolve_download_target(target: &Path, key: &str) -> Result<PathBuf, TransferError> {
    if target.as_os_str().is_empty() {
        return Err(TransferError::invalid("empty download path"));
    }
    let raw = target.as_os_str().to_string_lossy();
    let names_dir = raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR);
    if names_dir || target.is_dir() {
        return Ok(target.join(file_name_for_key(key)?));
    }
    Ok(target.to_path_buf())
}
