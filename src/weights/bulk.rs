use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::settings::FetchTool;
use crate::error::{ProvisionError, Result};

use super::archive::NativeFetcher;

/// Fetches one archive-or-file URL into a directory, extracting archives.
pub trait BulkFetcher {
    fn fetch_and_extract(&self, identifier: &str, url: &str, directory: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BulkTransfer {
    pub directory: PathBuf,
    pub bytes: Option<u64>,
    pub elapsed: Duration,
}

/// Prepares the destination, runs the fetcher and reports timing and size.
///
/// Identifiers with a `/` land in the matching subfolder of `destination`.
pub fn download(
    fetcher: &dyn BulkFetcher,
    identifier: &str,
    url: &str,
    destination: &Path,
) -> Result<BulkTransfer> {
    let directory = match identifier.rsplit_once('/') {
        Some((subfolder, _)) => destination.join(subfolder),
        None => destination.to_path_buf(),
    };
    fs::create_dir_all(&directory).map_err(|err| ProvisionError::io(&directory, err))?;

    info!(identifier, destination = %directory.display(), "downloading weight");
    let start = Instant::now();
    fetcher.fetch_and_extract(identifier, url, &directory)?;
    let elapsed = start.elapsed();

    let basename = identifier.rsplit('/').next().unwrap_or(identifier);
    let bytes = fs::metadata(directory.join(basename)).map(|meta| meta.len()).ok();
    let seconds = elapsed.as_secs_f64();
    match bytes {
        Some(bytes) => info!(
            identifier,
            destination = %directory.display(),
            "downloaded in {seconds:.2}s, size: {:.2}MB",
            bytes as f64 / (1024.0 * 1024.0)
        ),
        None => info!(
            identifier,
            destination = %directory.display(),
            "downloaded in {seconds:.2}s"
        ),
    }

    Ok(BulkTransfer {
        directory,
        bytes,
        elapsed,
    })
}

/// Runs an external fetch tool, `pget -xf <url> <dest>` by default.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Returns a fetcher only if the configured program can be found.
    pub fn resolve(tool: &FetchTool) -> Option<Self> {
        let program = locate_program(&tool.program)?;
        Some(Self::new(program, tool.args.clone()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl BulkFetcher for CommandFetcher {
    fn fetch_and_extract(&self, identifier: &str, url: &str, directory: &Path) -> Result<()> {
        debug!(program = %self.program.display(), url, "spawning fetch tool");
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(url)
            .arg(directory)
            .status()
            .map_err(|err| ProvisionError::BulkFetchFailed {
                identifier: identifier.to_string(),
                url: url.to_string(),
                reason: format!("failed to spawn {:?}: {err}", self.program),
            })?;

        if !status.success() {
            return Err(ProvisionError::BulkFetchFailed {
                identifier: identifier.to_string(),
                url: url.to_string(),
                reason: format!("{:?} exited with status {:?}", self.program, status.code()),
            });
        }
        Ok(())
    }
}

/// Picks the external tool when it is installed, the native backend otherwise.
pub fn select_fetcher(tool: &FetchTool) -> Result<Box<dyn BulkFetcher>> {
    match CommandFetcher::resolve(tool) {
        Some(fetcher) => {
            debug!(program = %fetcher.program().display(), "using external fetch tool");
            Ok(Box::new(fetcher))
        }
        None => {
            info!(
                program = %tool.program.display(),
                "fetch tool not found; falling back to native downloads"
            );
            Ok(Box::new(NativeFetcher::new()?))
        }
    }
}

fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
