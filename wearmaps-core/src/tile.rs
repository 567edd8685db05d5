//! Map tiles: request/response types and the static-map URL.

use serde::{Deserialize, Serialize};

/// Default static-map endpoint.
pub const DEFAULT_STATIC_MAP_URL: &str = "http://maps.googleapis.com/maps/api/staticmap";

/// Image size requested from the static-map API.
pub const IMAGE_SIZE: &str = "512x512";
pub const MAP_TYPE: &str = "roadmap";
pub const IMAGE_FORMAT: &str = "jpg";

/// A tile asked for by the wearable. Row and column are the wearable's own grid
/// position and are echoed back untouched; only the center and zoom go upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileRequest {
    pub row: i32,
    pub col: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: u8,
}

/// A fetched tile, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResponse {
    pub request: TileRequest,
    pub image: Vec<u8>,
}

/// Where tile images come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMapSource {
    base_url: String,
    api_key: Option<String>,
}

impl StaticMapSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the image centered on (`latitude`, `longitude`) at `zoom`.
    pub fn url(&self, latitude: f64, longitude: f64, zoom: u8) -> String {
        let mut url = format!(
            "{}?center={:.6},{:.6}&zoom={}&size={}&maptype={}&format={}",
            self.base_url, latitude, longitude, zoom, IMAGE_SIZE, MAP_TYPE, IMAGE_FORMAT
        );
        if let Some(key) = &self.api_key {
            url.push_str("&key=");
            url.push_str(key);
        }
        url
    }

    pub fn url_for(&self, request: &TileRequest) -> String {
        self.url(request.latitude, request.longitude, request.zoom)
    }
}

impl Default for StaticMapSource {
    fn default() -> Self {
        Self::new(DEFAULT_STATIC_MAP_URL, None)
    }
}

/// Network or I/O failure while downloading a tile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("failed to read body: {0}")]
    Body(String),
}
