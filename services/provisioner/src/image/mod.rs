//! Gold image acquisition.
//!
//! A gold image is an archive holding one or more virtual disks. Before any
//! machine can use it, the image is resolved to a local file (downloaded if
//! remote), optionally verified against a declared checksum, and unpacked
//! once into a cache directory shared by every machine built from it.
//!
//! ## Layout
//!
//! ```text
//! <base>/gold/<image-name>/   unpacked disks, one directory per image
//! ```

mod checksum;
mod store;

use std::path::PathBuf;

use thiserror::Error;

use crate::command::CommandError;

pub use checksum::{digest_file, verify, ChecksumType};
pub use store::{gold_name, Checksum, ImageSource, ImageStore};

/// Errors from image operations.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image locator '{locator}': {source}")]
    InvalidLocator {
        locator: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("cannot derive a file name from '{0}'")]
    NoFileName(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to download {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("invalid checksum type '{0}' (expected md5, sha1, sha256 or sha512)")]
    InvalidChecksumType(String),

    #[error(
        "checksum does not match for {}: computed {computed} ({algorithm}), expected {expected}",
        .path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        algorithm: ChecksumType,
        computed: String,
        expected: String,
    },

    #[error("failed to unpack image {}: {source}", .image.display())]
    Unpack {
        image: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
