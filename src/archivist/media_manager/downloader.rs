use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::DownloadError;

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the bytes behind a URL. Injected into the media pipeline so tests can swap the
/// network for a double.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError>;
}

/// [`Downloader`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeout(DEFAULT_DOWNLOAD_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::Timeout(url.to_string())
    } else {
        DownloadError::Other(format!("{url}: {error}"))
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        tracing::debug!(target: "archivist::media_manager::download", "GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        match response.status() {
            StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS | StatusCode::FORBIDDEN => {
                Err(DownloadError::Blocked(url.to_string()))
            }
            StatusCode::NOT_FOUND => Err(DownloadError::NotFound(url.to_string())),
            status if !status.is_success() => {
                Err(DownloadError::Other(format!("{url}: HTTP {status}")))
            }
            _ => {
                let bytes = response.bytes().await.map_err(|e| classify(url, e))?;
                Ok(bytes.to_vec())
            }
        }
    }
}
