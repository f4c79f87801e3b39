use std::path::{Path, PathBuf};

/// Resolves where `identifier` would live under `destination`.
///
/// Callers pass either the directory or the full file path; a destination
/// that already ends with the identifier is taken as the file itself.
#[must_use]
pub fn candidate_path(identifier: &str, destination: &Path) -> PathBuf {
    if destination.to_string_lossy().ends_with(identifier) {
        destination.to_path_buf()
    } else {
        destination.join(identifier)
    }
}

/// Presence by path only. Size and checksum are never consulted, so a
/// truncated file counts as present.
#[must_use]
pub fn exists(identifier: &str, destination: &Path) -> bool {
    candidate_path(identifier, destination).exists()
}
