use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use tar::Archive;
use tracing::debug;
use zip::read::ZipArchive;

use crate::error::{ProvisionError, Result};

use super::bulk::BulkFetcher;

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    Zip,
    File,
}

impl ArchiveFormat {
    /// Guesses the format from the URL path, ignoring query and fragment.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if path.ends_with(".tar.bz2") || path.ends_with(".tbz2") {
            ArchiveFormat::TarBz2
        } else if path.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if path.ends_with(".zip") {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::File
        }
    }
}

/// In-process stand-in for the external fetch tool: blocking HTTP download
/// into a staging file, then extraction into the destination directory.
pub struct NativeFetcher {
    client: Client,
}

impl NativeFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(None)
            .build()
            .map_err(|err| ProvisionError::HttpClient(err.to_string()))?;
        Ok(Self { client })
    }

    fn stage(&self, identifier: &str, url: &str, staging: &Path) -> Result<u64> {
        let failed = |reason: String| ProvisionError::BulkFetchFailed {
            identifier: identifier.to_string(),
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| failed(err.to_string()))?;

        let mut file = File::create(staging).map_err(|err| ProvisionError::io(staging, err))?;
        let mut downloaded = 0u64;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| failed(format!("read download chunk: {err}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| ProvisionError::io(staging, err))?;
            downloaded += read as u64;
        }
        Ok(downloaded)
    }
}

impl BulkFetcher for NativeFetcher {
    fn fetch_and_extract(&self, identifier: &str, url: &str, directory: &Path) -> Result<()> {
        let format = ArchiveFormat::from_url(url);
        // plain files land under the identifier so presence checks find them
        let basename = identifier.rsplit('/').next().unwrap_or(identifier);
        let remote_name = filename_from_uri(url).unwrap_or_else(|| basename.to_string());
        let staging = directory.join(format!(".{remote_name}.download"));

        let downloaded = self.stage(identifier, url, &staging)?;
        debug!(identifier, bytes = downloaded, ?format, "staged download");

        let result = extract_into(format, &staging, directory, basename).map_err(|err| {
            ProvisionError::BulkFetchFailed {
                identifier: identifier.to_string(),
                url: url.to_string(),
                reason: format!("extract: {err}"),
            }
        });
        let _ = fs::remove_file(&staging);
        result
    }
}

/// Unpacks `archive_path` into `directory`. Plain files are copied to
/// `directory/filename`.
pub fn extract_into(
    format: ArchiveFormat,
    archive_path: &Path,
    directory: &Path,
    filename: &str,
) -> io::Result<()> {
    let file = File::open(archive_path)?;
    match format {
        ArchiveFormat::Tar => extract_tar(file, directory),
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(file), directory),
        ArchiveFormat::TarBz2 => extract_tar(BzDecoder::new(file), directory),
        ArchiveFormat::Zip => extract_zip(file, directory),
        ArchiveFormat::File => extract_file(file, &directory.join(filename)),
    }
}

fn extract_tar<R: Read>(reader: R, directory: &Path) -> io::Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        // unpack_in refuses entries escaping the directory
        entry.unpack_in(directory)?;
    }
    Ok(())
}

fn extract_zip(file: File, directory: &Path) -> io::Result<()> {
    let mut archive = ZipArchive::new(file).map_err(io::Error::other)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(io::Error::other)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let dest = directory.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&dest)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

fn extract_file(mut file: File, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut dest = File::create(target)?;
    io::copy(&mut file, &mut dest)?;
    Ok(())
}

fn filename_from_uri(uri: &str) -> Option<String> {
    let last_segment = uri.split(['?', '#']).next()?.rsplit('/').next()?;
    let clean = last_segment.trim();
    if clean.is_empty() {
        None
    } else {
        Some(clean.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::presence;
    use flate2::{write::GzEncoder, Compression};
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    /// Answers a single request with `status` and `body`, returning the base URL.
    fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(&body).unwrap();
        });
        format!("http://{addr}")
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn tar_bytes(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn format_detection_ignores_query() {
        assert_eq!(ArchiveFormat::from_url("https://x/vae.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_url("https://x/a.TAR.GZ?sig=1"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_url("https://x/a.tar.bz2"), ArchiveFormat::TarBz2);
        assert_eq!(ArchiveFormat::from_url("https://x/a.zip#frag"), ArchiveFormat::Zip);
        assert_eq!(
            ArchiveFormat::from_url("https://x/model.safetensors?download=true"),
            ArchiveFormat::File
        );
    }

    #[test]
    fn tar_archive_unpacks_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("vae.tar");
        fs::write(&archive, tar_bytes("vae.safetensors", b"weights")).unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        extract_into(ArchiveFormat::Tar, &archive, &out, "vae.tar").unwrap();
        assert_eq!(fs::read(out.join("vae.safetensors")).unwrap(), b"weights");
    }

    #[test]
    fn gzipped_tar_unpacks_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&tar_bytes("sub/model.pt", b"tensor"))
            .unwrap();
        let archive = dir.path().join("model.tar.gz");
        fs::write(&archive, encoder.finish().unwrap()).unwrap();

        extract_into(ArchiveFormat::TarGz, &archive, dir.path(), "model.tar.gz").unwrap();
        assert_eq!(fs::read(dir.path().join("sub/model.pt")).unwrap(), b"tensor");
    }

    #[test]
    fn zip_archive_unpacks_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("config.json", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }

        let out = dir.path().join("out");
        extract_into(ArchiveFormat::Zip, &archive, &out, "pack.zip").unwrap();
        assert_eq!(fs::read(out.join("config.json")).unwrap(), b"{}");
    }

    #[test]
    fn plain_file_is_copied_under_name() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join(".model.onnx.download");
        fs::write(&staged, b"onnx").unwrap();
        extract_into(ArchiveFormat::File, &staged, dir.path(), "model.onnx").unwrap();
        assert_eq!(fs::read(dir.path().join("model.onnx")).unwrap(), b"onnx");
    }

    #[test]
    fn downloaded_tar_is_extracted_and_staging_removed() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("200 OK", tar_bytes("vae.safetensors", b"weights"));

        NativeFetcher::new()
            .unwrap()
            .fetch_and_extract("vae.safetensors", &format!("{base}/vae.safetensors.tar"), dir.path())
            .unwrap();

        assert_eq!(fs::read(dir.path().join("vae.safetensors")).unwrap(), b"weights");
        assert_eq!(dir_entries(dir.path()), vec!["vae.safetensors".to_string()]);
    }

    #[test]
    fn plain_download_is_named_after_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("200 OK", b"tensor".to_vec());
        let url = format!("{base}/resolve/main/diffusion_pytorch_model.safetensors?download=true");

        NativeFetcher::new()
            .unwrap()
            .fetch_and_extract("vae.safetensors", &url, dir.path())
            .unwrap();

        assert!(presence::exists("vae.safetensors", dir.path()));
        assert_eq!(dir_entries(dir.path()), vec!["vae.safetensors".to_string()]);
        assert_eq!(fs::read(dir.path().join("vae.safetensors")).unwrap(), b"tensor");
    }

    #[test]
    fn error_status_is_bulk_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("404 Not Found", b"missing".to_vec());
        let url = format!("{base}/vae.tar");

        let err = NativeFetcher::new()
            .unwrap()
            .fetch_and_extract("vae.safetensors", &url, dir.path())
            .unwrap_err();

        match err {
            ProvisionError::BulkFetchFailed {
                identifier,
                url: failed_url,
                reason,
            } => {
                assert_eq!(identifier, "vae.safetensors");
                assert_eq!(failed_url, url);
                assert!(reason.contains("404"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn corrupt_archive_fails_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("200 OK", b"not a zip".to_vec());

        let err = NativeFetcher::new()
            .unwrap()
            .fetch_and_extract("pack", &format!("{base}/pack.zip"), dir.path())
            .unwrap_err();

        assert!(err.to_string().contains("extract"));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn uri_filename_strips_query() {
        assert_eq!(
            filename_from_uri("https://hf.co/m/resolve/main/a.gguf?download=1").as_deref(),
            Some("a.gguf")
        );
        assert_eq!(filename_from_uri("https://hf.co/m/"), None);
    }
}
