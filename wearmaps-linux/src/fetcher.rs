//! Tile download over HTTP.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace, warn};
use wearmaps_core::{FetchError, StaticMapSource};

const USER_AGENT: &str = concat!("wearmaps-linux/", env!("CARGO_PKG_VERSION"));

/// Downloads the image for one tile center.
pub trait TileFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        latitude: f64,
        longitude: f64,
        zoom: u8,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Static-map fetcher backed by reqwest. Every request is bounded by `timeout_secs`.
#[derive(Clone)]
pub struct HttpTileFetcher {
    client: reqwest::Client,
    source: StaticMapSource,
    timeout_secs: u64,
}

impl HttpTileFetcher {
    pub fn new(source: StaticMapSource, timeout_secs: u64) -> Result<Self, FetchError> {
        let timeout_secs = timeout_secs.max(1);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Request(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            source,
            timeout_secs,
        })
    }

    pub fn source(&self) -> &StaticMapSource {
        &self.source
    }
}

impl TileFetcher for HttpTileFetcher {
    async fn fetch(&self, latitude: f64, longitude: f64, zoom: u8) -> Result<Vec<u8>, FetchError> {
        let url = self.source.url(latitude, longitude, zoom);
        trace!(url = %url, "tile GET");

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!(url = %url, "tile request timed out");
                return Err(FetchError::Timeout(self.timeout_secs));
            }
            Err(e) => {
                warn!(url = %url, error = %e, is_connect = e.is_connect(), "tile request failed");
                return Err(FetchError::Request(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "tile HTTP error status");
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        match response.bytes().await {
            Ok(bytes) => {
                debug!(bytes = bytes.len(), zoom, "tile downloaded");
                Ok(bytes.to_vec())
            }
            Err(e) if e.is_timeout() => Err(FetchError::Timeout(self.timeout_secs)),
            Err(e) => Err(FetchError::Body(e.to_string())),
        }
    }
}
