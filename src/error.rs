use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a provisioning call.
///
/// Unknown identifiers, already-present artifacts and a missing
/// `Content-Disposition` header are not errors and never surface here.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The bulk fetch tool exited non-zero, could not be spawned, or the
    /// native backend failed to fetch or extract the archive.
    #[error("bulk fetch of {identifier} from {url} failed: {reason}")]
    BulkFetchFailed {
        identifier: String,
        url: String,
        reason: String,
    },

    /// Non-2xx response or transport error during a streamed download.
    #[error("streaming fetch of {name} from {url} failed: {reason}")]
    StreamingFetchFailed {
        name: String,
        url: String,
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    /// A declared SHA-256 digest did not match the downloaded file.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The manifest or CivitAI list source could not be parsed.
    #[error("invalid manifest source: {0}")]
    Manifest(String),

    /// The workflow graph could not be parsed or lacks a required node.
    #[error("invalid workflow graph: {0}")]
    Workflow(String),

    /// A filesystem I/O error occurred.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
