//! On-demand image downloads.

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("image request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("image request returned no data")]
    NoData,
}

/// Fetches raw image bytes for a single URL. The caller owns persisting them.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Downloads images over HTTP with the transport's default timeouts
#[derive(Debug, Clone, Default)]
pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ImageSource for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!("Fetching image {url}");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(FetchError::Network)?;

        let bytes = response.bytes().await.map_err(FetchError::Network)?;
        if bytes.is_empty() {
            return Err(FetchError::NoData);
        }

        Ok(bytes.to_vec())
    }
}
