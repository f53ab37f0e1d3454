use super::client::HttpClient;
use async_trait::async_trait;
use std::time::Duration;

pub struct BasicClient(reqwest::Client);

impl BasicClient {
    /// Client with request and connect timeouts, accepting gzip bodies.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .gzip(true)
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
