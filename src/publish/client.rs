use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue, InvalidHeaderValue};
use reqwest::{Request, Response};

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> Self {
        Self(reqwest::Client::new())
    }
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        self.0.execute(req).await
    }
}

/// An [`HttpClient`] wrapper that sends `Authorization: Bearer <token>`.
pub struct BearerToken<C> {
    inner: C,
    value: HeaderValue,
}

impl<C> BearerToken<C> {
    /// Fails when the token cannot be used as a header value.
    pub fn new(inner: C, token: &str) -> Result<Self, InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        Ok(Self { inner, value })
    }

    pub fn authorize(&self, req: &mut Request) {
        req.headers_mut().insert(AUTHORIZATION, self.value.clone());
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for BearerToken<C> {
    async fn execute(&self, mut req: Request) -> reqwest::Result<Response> {
        self.authorize(&mut req);
        self.inner.execute(req).await
    }
}
