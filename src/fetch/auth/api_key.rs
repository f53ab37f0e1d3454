use crate::fetch::client::HttpClient;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// `header_name` is the header field to set (e.g. `"Authorization"` or a
/// provider-specific name such as `"x-api-key"`). Both name and value are
/// validated when the wrapper is built, so requests never fail on them.
pub struct ApiKey<C> {
    pub inner: C,
    header_name: HeaderName,
    value: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())?;
        let mut value = HeaderValue::from_str(key)?;
        value.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            value,
        })
    }

    /// Convenience constructor that uses `Authorization: Bearer <key>`, the
    /// most common pattern for OAuth-style tokens.
    pub fn bearer(inner: C, key: &str) -> Result<Self> {
        Self::new(inner, "Authorization", &format!("Bearer {key}"))
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.value.clone());
        self.inner.execute(req).await
    }
}
