mod archive;
mod bulk;
mod civitai;
mod integrity;
mod manifest;
mod outcome;
mod presence;
mod provision;
mod streaming;

/// File suffixes recognised as weight references in a workflow graph.
pub const SUPPORTED_FILETYPES: &[&str] = &[
    ".ckpt",
    ".safetensors",
    ".pt",
    ".pth",
    ".bin",
    ".onnx",
    ".torchscript",
    ".engine",
    ".patch",
];

pub use archive::{extract_into, ArchiveFormat, NativeFetcher};
pub use bulk::{download as bulk_download, select_fetcher, BulkFetcher, BulkTransfer, CommandFetcher};
pub use civitai::{load_list as load_civitai_list, parse_list as parse_civitai_list, CivitaiModel};
pub use integrity::{compute_sha256, verify_sha256};
pub use manifest::{LicenseClass, Manifest, WeightEntry, WeightLocation};
pub use outcome::{DownloadOutcome, OutcomeStatus, ProvisionReport};
pub use presence::{candidate_path, exists};
pub use provision::Provisioner;
pub use streaming::{
    authenticated_url, filename_from_disposition, HttpTransport, Probe, StreamBody,
    StreamingDownloader, TransferProgress, Transport, TransportError,
};
