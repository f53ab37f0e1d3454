use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes one HTTP request. Auth wrappers implement this around an inner
/// client so credentials stay out of the fetch path.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Box<C> {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        (**self).execute(req).await
    }
}
