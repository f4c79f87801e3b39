use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};

use super::civitai::CivitaiModel;
use super::outcome::DownloadOutcome;

const CHUNK_SIZE: usize = 8 * 1024;
const TOKEN_PARAM: &str = "token";

static EXTENDED_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)filename\*\s*=\s*(?:[a-z0-9_-]+)?'[^']*'([^;]+)"#).expect("valid regex")
});
static QUOTED_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)filename\s*=\s*"([^"]*)""#).expect("valid regex"));
static BARE_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)filename\s*=\s*([^;"]+)"#).expect("valid regex"));

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // the request URL carries the token
        Self(err.without_url().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub content_disposition: Option<String>,
}

pub struct StreamBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read>,
}

/// The two HTTP calls the streaming download needs.
pub trait Transport {
    /// Header-only request, following redirects.
    fn probe(&self, url: &Url) -> Result<Probe, TransportError>;
    /// GET whose body is read incrementally. Non-2xx must be an error.
    fn open(&self, url: &Url) -> Result<StreamBody, TransportError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder().timeout(None).build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn probe(&self, url: &Url) -> Result<Probe, TransportError> {
        let response = self.client.head(url.clone()).send()?;
        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(Probe {
            content_disposition,
        })
    }

    fn open(&self, url: &Url) -> Result<StreamBody, TransportError> {
        let response = self.client.get(url.clone()).send()?.error_for_status()?;
        Ok(StreamBody {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded: u64,
    /// `None` when the server did not report a length.
    pub total: Option<u64>,
}

impl TransferProgress {
    #[must_use]
    pub fn fraction(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => {
                Some((self.downloaded as f64 / total as f64).clamp(0.0, 1.0) as f32)
            }
            _ => None,
        }
    }
}

/// Downloads CivitAI-hosted weights with the API token appended.
pub struct StreamingDownloader {
    transport: Box<dyn Transport>,
    token: Option<String>,
    models_root: PathBuf,
}

impl StreamingDownloader {
    pub fn new(
        transport: Box<dyn Transport>,
        token: Option<String>,
        models_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            token,
            models_root: models_root.into(),
        }
    }

    pub fn fetch_with_token(&self, model: &CivitaiModel) -> Result<DownloadOutcome> {
        let mut bar: Option<ProgressBar> = None;
        let outcome = self.fetch_with_token_with_progress(model, |progress| {
            bar.get_or_insert_with(|| progress_bar(&model.display_name, progress.total))
                .set_position(progress.downloaded);
        });
        if let Some(bar) = bar {
            match &outcome {
                Ok(_) => bar.finish_and_clear(),
                Err(_) => bar.abandon(),
            }
        }
        outcome
    }

    pub fn fetch_with_token_with_progress<F>(
        &self,
        model: &CivitaiModel,
        mut progress: F,
    ) -> Result<DownloadOutcome>
    where
        F: FnMut(TransferProgress),
    {
        let failed = |reason: String| ProvisionError::StreamingFetchFailed {
            name: model.display_name.clone(),
            url: model.url.clone(),
            reason,
        };

        let url = authenticated_url(&model.url, self.token.as_deref()).map_err(failed)?;

        let probe = self
            .transport
            .probe(&url)
            .map_err(|err| failed(err.to_string()))?;
        let filename = match probe
            .content_disposition
            .as_deref()
            .and_then(filename_from_disposition)
        {
            Some(filename) => filename,
            None => {
                debug!(name = %model.display_name, "no filename in response headers; using display name");
                bare_filename(&model.display_name)
                    .ok_or_else(|| failed("display name is not a usable filename".into()))?
            }
        };

        let folder = self.models_root.join(&model.destination_directory);
        fs::create_dir_all(&folder).map_err(|err| ProvisionError::io(&folder, err))?;
        let destination = folder.join(&filename);

        if destination.exists() {
            return Ok(DownloadOutcome::skipped(filename, destination));
        }

        info!(%filename, folder = %folder.display(), "downloading weight");
        let start = Instant::now();
        let mut body = self
            .transport
            .open(&url)
            .map_err(|err| failed(err.to_string()))?;

        let total = body.content_length.filter(|length| *length > 0);
        let downloaded = write_stream(&mut body.reader, &destination, |downloaded| {
            progress(TransferProgress { downloaded, total })
        })
        .map_err(|err| match err {
            StreamFailure::Read(err) => failed(format!("read download chunk: {err}")),
            StreamFailure::Write(err) => ProvisionError::io(&destination, err),
        })?;

        Ok(DownloadOutcome::succeeded(
            filename,
            destination,
            downloaded,
            start.elapsed(),
        ))
    }
}

enum StreamFailure {
    Read(std::io::Error),
    Write(std::io::Error),
}

fn write_stream<F>(reader: &mut dyn Read, path: &Path, mut progress: F) -> Result<u64, StreamFailure>
where
    F: FnMut(u64),
{
    let mut file = File::create(path).map_err(StreamFailure::Write)?;
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    loop {
        let read = reader.read(&mut buffer).map_err(StreamFailure::Read)?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read]).map_err(StreamFailure::Write)?;
        downloaded += read as u64;
        progress(downloaded);
    }
    file.flush().map_err(StreamFailure::Write)?;
    Ok(downloaded)
}

/// Appends the token as a query parameter, keeping existing parameters.
pub fn authenticated_url(url: &str, token: Option<&str>) -> Result<Url, String> {
    let mut url = Url::parse(url).map_err(|err| format!("invalid url: {err}"))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair(TOKEN_PARAM, token);
    }
    Ok(url)
}

/// Extracts a bare filename from a `Content-Disposition` value.
#[must_use]
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let raw = EXTENDED_FILENAME
        .captures(header)
        .map(|caps| percent_decode_str(caps[1].trim()).decode_utf8_lossy().into_owned())
        .or_else(|| QUOTED_FILENAME.captures(header).map(|caps| caps[1].to_string()))
        .or_else(|| BARE_FILENAME.captures(header).map(|caps| caps[1].trim().to_string()))?;
    bare_filename(&raw)
}

/// Last path component of `raw`, or `None` if nothing usable is left.
fn bare_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

fn progress_bar(name: &str, total: Option<u64>) -> ProgressBar {
    let bar = match total {
        Some(total) => {
            let bar = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{msg} [{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec})",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} [{elapsed_precise}] {bytes}")
            {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        }
    };
    bar.set_message(name.to_string());
    bar
}
