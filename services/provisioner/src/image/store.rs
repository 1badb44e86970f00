//! Image store: resolve, verify and unpack gold images.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::checksum::{self, ChecksumType};
use super::ImageError;
use crate::command::CommandRunner;
use crate::disk::DiskLock;
use crate::machine::MachineConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A declared digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub value: String,
    pub kind: ChecksumType,
}

/// Where an image comes from and how to check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Local path or `http(s)://` URL.
    pub locator: String,
    pub checksum: Option<Checksum>,
}

impl ImageSource {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            checksum: None,
        }
    }

    /// Build from a declared machine, validating the checksum algorithm.
    ///
    /// A checksum without an algorithm is rejected as an invalid (empty)
    /// checksum type; an algorithm without a checksum is ignored.
    pub fn from_config(config: &MachineConfig) -> Result<Self, ImageError> {
        let checksum = match config.checksum.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => {
                let kind = config.checksum_type.as_deref().unwrap_or("").parse()?;
                Some(Checksum {
                    value: value.to_string(),
                    kind,
                })
            }
        };
        Ok(Self {
            locator: config.image.clone(),
            checksum,
        })
    }
}

/// Cache directory name for an image file: the base name with the archive
/// extension stripped, and a `.tar` inner extension stripped too.
///
/// `ubuntu.tar.xz` becomes `ubuntu`, `img.tgz` becomes `img`.
pub fn gold_name(image: &Path) -> String {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.strip_suffix(".tar") {
        Some(inner) if !inner.is_empty() => inner.to_string(),
        _ => stem,
    }
}

async fn is_populated(dir: &Path) -> Result<bool, std::io::Error> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Fetches, verifies and unpacks gold images.
pub struct ImageStore {
    gold_dir: PathBuf,
    download_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    disk_lock: DiskLock,
    client: reqwest::Client,
}

impl ImageStore {
    /// Create a store unpacking into `gold_dir` and downloading into
    /// `download_dir`. Unpacking is serialized through `disk_lock`.
    pub fn new(
        gold_dir: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        disk_lock: DiskLock,
    ) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ImageError::Client)?;

        Ok(Self {
            gold_dir: gold_dir.into(),
            download_dir: download_dir.into(),
            runner,
            disk_lock,
            client,
        })
    }

    /// Cache directory for an image file.
    pub fn gold_path(&self, image: &Path) -> PathBuf {
        self.gold_dir.join(gold_name(image))
    }

    /// Resolve a locator to a local file, downloading remote images.
    pub async fn resolve(&self, locator: &str) -> Result<PathBuf, ImageError> {
        let url = match Url::parse(locator) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(PathBuf::from(locator)),
            Err(source) => {
                return Err(ImageError::InvalidLocator {
                    locator: locator.to_string(),
                    source,
                })
            }
        };

        match url.scheme() {
            "http" | "https" => self.download(&url).await,
            scheme => Err(ImageError::UnsupportedScheme(scheme.to_string())),
        }
    }

    /// Download `url` into the download directory, named after the last
    /// path segment. The file is always fetched again; a previous download
    /// under the same name is replaced only once the new one is complete.
    async fn download(&self, url: &Url) -> Result<PathBuf, ImageError> {
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ImageError::NoFileName(url.to_string()))?;

        let target = self.download_dir.join(file_name);
        tokio::fs::create_dir_all(&self.download_dir).await?;

        // Unique per call, so concurrent downloads of one URL never share it.
        // Removed on drop if the download fails.
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".tmp")
            .tempfile_in(&self.download_dir)?
            .into_temp_path();

        let start = Instant::now();
        info!(url = %url, "Downloading image");

        let download_error = |source| ImageError::Download {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(download_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(&temp).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(download_error)?;
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        temp.persist(&target).map_err(|e| e.error)?;

        info!(
            url = %url,
            path = %target.display(),
            bytes = bytes_written,
            duration_ms = start.elapsed().as_millis() as u64,
            "Image downloaded"
        );
        Ok(target)
    }

    /// Verify a local image against a declared digest.
    pub async fn verify(&self, image: &Path, checksum: &Checksum) -> Result<(), ImageError> {
        debug!(path = %image.display(), algorithm = %checksum.kind, "Verifying image checksum");
        checksum::verify(image, &checksum.value, checksum.kind.as_str()).await
    }

    /// Unpack `image` into `dest` unless `dest` already has content.
    ///
    /// Returns whether an extraction actually ran. The archive is extracted
    /// into a sibling staging directory and renamed into place, so a
    /// non-empty `dest` always holds a complete image. A failed extraction
    /// leaves nothing behind.
    pub async fn unpack(&self, image: &Path, dest: &Path) -> Result<bool, ImageError> {
        if is_populated(dest).await? {
            debug!(dest = %dest.display(), "Gold image already unpacked");
            return Ok(false);
        }

        let _guard = self.disk_lock.lock().await;

        // Another call may have finished while we waited.
        if is_populated(dest).await? {
            debug!(dest = %dest.display(), "Gold image already unpacked");
            return Ok(false);
        }

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", gold_name(dest)))
            .suffix(".partial")
            .tempdir_in(parent)?;

        let start = Instant::now();
        info!(image = %image.display(), dest = %dest.display(), "Unpacking gold image");

        let args = vec![
            "-x".to_string(),
            "-C".to_string(),
            staging.path().to_string_lossy().into_owned(),
            "-f".to_string(),
            image.to_string_lossy().into_owned(),
        ];
        let result = match self.runner.run("tar", &args).await {
            Ok(output) => output.ensure_success("tar", &args).map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(source) = result {
            if let Err(e) = staging.close() {
                warn!(dest = %dest.display(), error = %e, "Failed to clean up partial unpack");
            }
            return Err(ImageError::Unpack {
                image: image.to_path_buf(),
                source,
            });
        }

        // An empty leftover directory would block the rename.
        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_dir(dest).await?;
        }
        tokio::fs::rename(staging.path(), dest).await?;

        info!(
            image = %image.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Gold image unpacked"
        );
        Ok(true)
    }

    /// Resolve, verify (when a checksum is declared) and unpack an image.
    /// Returns the gold directory holding its disks.
    pub async fn prepare(&self, source: &ImageSource) -> Result<PathBuf, ImageError> {
        let image = self.resolve(&source.locator).await?;

        if let Some(checksum) = &source.checksum {
            self.verify(&image, checksum).await?;
        }

        let gold = self.gold_path(&image);
        self.unpack(&image, &gold).await?;
        Ok(gold)
    }
}
