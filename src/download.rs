use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use reqwest::{StatusCode, blocking::Client};
use thiserror::Error;

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("downloading {url} failed with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("downloading {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("writing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fetches a remote file into a local path.
pub trait Downloader {
    /// Returns the number of bytes written to `destination`.
    fn download(&self, url: &str, destination: &Path) -> Result<u64, DownloadError>;
}

pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| DownloadError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let transport = |source| DownloadError::Transport {
            url: url.to_string(),
            source,
        };
        let io_error = |source| DownloadError::Io {
            path: destination.to_path_buf(),
            source,
        };

        let mut response = self.client.get(url).send().map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status,
            });
        }

        let mut file = BufWriter::new(File::create(destination).map_err(io_error)?);
        let written = response
            .copy_to(&mut file)
            .map_err(transport)
            .and_then(|bytes| file.flush().map(|_| bytes).map_err(io_error));
        drop(file);
        match written {
            Ok(bytes) => {
                debug!("Downloaded {bytes} byte(s) from {url} to {destination:?}");
                Ok(bytes)
            }
            Err(err) => {
                // Drop the truncated file.
                if let Err(remove_err) = fs::remove_file(destination) {
                    debug!("Could not remove partial download {destination:?}: {remove_err}");
                }
                Err(err)
            }
        }
    }
}
