use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use super::{HttpClient, fetch_bytes};

/// Something the scheduler can pull a raw batch from once per cycle.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Short description for logs and statistics.
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<u8>>;
}

pub struct HttpSource {
    client: Box<dyn HttpClient>,
    url: String,
}

impl HttpSource {
    pub fn new(client: Box<dyn HttpClient>, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl BatchSource for HttpSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        fetch_bytes(self.client.as_ref(), &self.url)
            .await
            .with_context(|| format!("fetching {}", self.url))
    }
}

/// Re-reads a local JSON file each cycle.
pub struct FileSource(PathBuf);

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

#[async_trait]
impl BatchSource for FileSource {
    fn describe(&self) -> String {
        self.0.display().to_string()
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.0)
            .await
            .with_context(|| format!("reading {}", self.0.display()))
    }
}

/// Picks an HTTP source for `http…` locations and a file source otherwise.
pub fn source_for(location: &str, client: Box<dyn HttpClient>) -> Box<dyn BatchSource> {
    if location.starts_with("http") {
        Box::new(HttpSource::new(client, location))
    } else {
        Box::new(FileSource::new(location))
    }
}
