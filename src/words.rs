//! Topic word lists, one JSON array of strings per level.

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Level;

pub type WordsResult<T> = Result<T, WordsError>;

#[derive(Debug, thiserror::Error)]
pub enum WordsError {
    #[error("could not read word list: {0}")]
    Io(#[from] std::io::Error),

    #[error("word list request failed: {0}")]
    Http(String),

    #[error("word list is not a JSON array of strings: {0}")]
    Format(#[from] serde_json::Error),
}

#[async_trait]
pub trait WordSource: Send + Sync {
    async fn fetch(&self, level: Level) -> WordsResult<Vec<String>>;
}

/// Word lists on disk as `{dir}/{level}.json`
pub struct StaticWords {
    dir: PathBuf,
}

impl StaticWords {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl WordSource for StaticWords {
    async fn fetch(&self, level: Level) -> WordsResult<Vec<String>> {
        let path = self.dir.join(format!("{}.json", level));
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Word lists served next to the hosted store
pub struct HttpWords {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWords {
    pub fn new(base_url: &str) -> WordsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WordsError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl WordSource for HttpWords {
    async fn fetch(&self, level: Level) -> WordsResult<Vec<String>> {
        let url = format!("{}{}", self.base_url, level.word_list_path());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| WordsError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WordsError::Http(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| WordsError::Http(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Uniform random pick; `None` for an empty list
pub fn pick_word(words: &[String]) -> Option<String> {
    words.choose(&mut rand::rng()).cloned()
}
