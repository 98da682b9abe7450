use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::Settings, error::ConfigurationError};

const GIF_SERVICE: &str = "gif search";
const MAX_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gif {
    pub id: String,
    pub title: String,
    pub url: String,
    pub preview_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum GifError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Request(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct GifPage {
    #[serde(default)]
    data: Vec<GifRecord>,
}

#[derive(Debug, Deserialize)]
struct GifRecord {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    images: GifImages,
}

#[derive(Debug, Default, Deserialize)]
struct GifImages {
    original: Option<GifImage>,
    fixed_height: Option<GifImage>,
    fixed_height_small: Option<GifImage>,
}

#[derive(Debug, Deserialize)]
struct GifImage {
    url: String,
    #[serde(default)]
    width: Option<String>,
    #[serde(default)]
    height: Option<String>,
}

impl GifRecord {
    fn into_gif(self) -> Option<Gif> {
        let GifImages {
            original,
            fixed_height,
            fixed_height_small,
        } = self.images;
        let preview_url = fixed_height_small.map(|image| image.url);
        let main = fixed_height.or(original)?;
        Some(Gif {
            id: self.id,
            title: self.title,
            width: main.width.as_deref().and_then(|w| w.parse().ok()),
            height: main.height.as_deref().and_then(|h| h.parse().ok()),
            url: main.url,
            preview_url,
        })
    }
}

/// Client for a Giphy-style search API.
#[derive(Debug, Clone)]
pub struct GifClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GifClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.gif_api_url.clone(), settings.gif_api_key.clone())
    }

    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<Gif>, GifError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch("search", &[("q", query.to_string())], limit)
            .await
    }

    pub async fn trending(&self, limit: u32) -> Result<Vec<Gif>, GifError> {
        self.fetch("trending", &[], limit).await
    }

    async fn fetch(
        &self,
        endpoint: &str,
        extra: &[(&str, String)],
        limit: u32,
    ) -> Result<Vec<Gif>, GifError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ConfigurationError::MissingApiKey(GIF_SERVICE))?;
        let url = format!("{}/v1/gifs/{endpoint}", self.base_url.trim_end_matches('/'));
        let mut query = vec![
            ("api_key", api_key.to_string()),
            ("limit", limit.clamp(1, MAX_LIMIT).to_string()),
        ];
        query.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        let page: GifPage = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()
            .with_context(|| format!("gif {endpoint} request failed"))?
            .json()
            .await
            .context("invalid gif response")?;
        let gifs: Vec<Gif> = page.data.into_iter().filter_map(GifRecord::into_gif).collect();
        debug!(endpoint, count = gifs.len(), "gif: results");
        Ok(gifs)
    }
}
