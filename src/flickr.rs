//! Flickr photo search for pinphotos.
//!
//! Issues a single `flickr.photos.search` request around a pin's coordinates
//! and turns the response into plain [`PhotoRecord`]s. Each search asks for a
//! randomly chosen result page so that revisiting the same pin shows a
//! different slice of nearby photos; the choice is made by a [`PageStrategy`]
//! so tests can pin it down.

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::Config;

pub const SEARCH_METHOD: &str = "flickr.photos.search";
/// Extra field carrying the medium-sized image URL
pub const IMAGE_URL_FIELD: &str = "url_m";

/// Metadata for one remote photo, before its bytes are cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub image_url: Option<String>,
}

impl PhotoRecord {
    pub fn new(id: &str, title: &str, image_url: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            image_url: Some(image_url.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("photo search request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("photo search returned status {0}")]
    Request(StatusCode),
    #[error("photo search returned an empty body")]
    NoData,
    #[error("could not parse photo search response: {0}")]
    Parse(String),
    #[error("photo search response carried no photo collection")]
    NoPhotoData,
}

/// Picks the result page for the next search
pub trait PageStrategy: Send + Sync {
    fn next_page(&self) -> u32;
}

/// Uniformly random page in `0..range`
#[derive(Debug, Clone, Copy)]
pub struct RandomPage {
    pub range: u32,
}

impl PageStrategy for RandomPage {
    fn next_page(&self) -> u32 {
        rand::thread_rng().gen_range(0..self.range.max(1))
    }
}

/// Always the same page
#[derive(Debug, Clone, Copy)]
pub struct FixedPage(pub u32);

impl PageStrategy for FixedPage {
    fn next_page(&self) -> u32 {
        self.0
    }
}

/// Interface for photo search services
#[async_trait]
pub trait PhotoSearch: Send + Sync {
    /// Search for photos around a coordinate. A single attempt, never retried.
    async fn search(&self, latitude: f64, longitude: f64) -> Result<Vec<PhotoRecord>, SearchError>;
}

/// Photo search backed by the Flickr REST API
pub struct FlickrClient {
    client: Client,
    base_url: Url,
    api_key: String,
    radius: u32,
    per_page: u32,
    pages: Box<dyn PageStrategy>,
}

impl FlickrClient {
    pub fn new(base_url: Url, api_key: String, pages: Box<dyn PageStrategy>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            radius: 1,
            per_page: 50,
            pages,
        }
    }

    /// Builds a client from the configured endpoint, key and paging settings
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid base_url {}: {}", config.base_url, e))?;

        Ok(Self {
            radius: config.radius,
            per_page: config.per_page,
            ..Self::new(
                base_url,
                config.api_key.clone(),
                Box::new(RandomPage {
                    range: config.page_range,
                }),
            )
        })
    }

    /// The full request URL for a search at the given coordinate and page
    pub fn search_url(&self, latitude: f64, longitude: f64, page: u32) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("method", SEARCH_METHOD)
            .append_pair("lat", &latitude.to_string())
            .append_pair("lon", &longitude.to_string())
            .append_pair("format", "json")
            .append_pair("nojsoncallback", "1")
            .append_pair("extras", IMAGE_URL_FIELD)
            .append_pair("radius", &self.radius.to_string())
            .append_pair("per_page", &self.per_page.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("api_key", &self.api_key);
        url
    }
}

#[async_trait]
impl PhotoSearch for FlickrClient {
    async fn search(&self, latitude: f64, longitude: f64) -> Result<Vec<PhotoRecord>, SearchError> {
        let page = self.pages.next_page();
        let url = self.search_url(latitude, longitude, page);
        debug!("Searching photos at {latitude}, {longitude} (page {page})");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(SearchError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Request(status));
        }

        let body = response.bytes().await.map_err(SearchError::Network)?;
        parse_search_response(&body)
    }
}

#[derive(Deserialize)]
struct RawPhoto {
    #[serde(default, deserialize_with = "string_or_number")]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "url_m")]
    image_url: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Parses a search response body into records, in the order the API returned them
pub fn parse_search_response(body: &[u8]) -> Result<Vec<PhotoRecord>, SearchError> {
    if body.is_empty() {
        return Err(SearchError::NoData);
    }

    let parsed: Value =
        serde_json::from_slice(body).map_err(|e| SearchError::Parse(e.to_string()))?;

    let root = parsed
        .as_object()
        .ok_or_else(|| SearchError::Parse("response is not a JSON object".to_string()))?;

    let Some(photos) = root.get("photos").and_then(Value::as_object) else {
        if let Some(message) = root.get("message").and_then(Value::as_str) {
            debug!("Photo search failed upstream: {message}");
        }
        return Err(SearchError::NoPhotoData);
    };

    let entries = photos
        .get("photo")
        .cloned()
        .ok_or(SearchError::NoPhotoData)?;

    let raw: Vec<RawPhoto> =
        serde_json::from_value(entries).map_err(|e| SearchError::Parse(e.to_string()))?;

    Ok(raw
        .into_iter()
        .map(|p| PhotoRecord {
            id: p.id,
            title: p.title,
            image_url: p.image_url,
        })
        .collect())
}
