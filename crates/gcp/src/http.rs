//! Authenticated JSON client shared by the REST collaborators.

use std::time::Duration;

use backup_core::{Error, Result, ServiceErrorCode};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::GcpConfig;

/// Appends percent-encoded path segments to a base URL.
pub fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// JSON-over-HTTPS client with bearer auth and error mapping.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &GcpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            access_token: config.access_token.clone(),
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.access_token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = send(self.request(Method::GET, url.clone())).await?;
        decode(url, response).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T> {
        let response = send(self.request(Method::POST, url.clone()).json(body)).await?;
        decode(url, response).await
    }

    /// POST without a body whose response is ignored.
    pub async fn post_empty(&self, url: Url) -> Result<()> {
        send(self.request(Method::POST, url)).await.map(|_| ())
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::unavailable(format!("request failed: {}", e)))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let kind = ServiceErrorCode::from_http_status(status.as_u16());
    debug!(url = %url, status = status.as_u16(), body = %body, "API call failed");

    Err(Error::service(
        kind,
        format!("{} {}: {}", status.as_u16(), url.path(), error_message(&body)),
    ))
}

async fn decode<T: DeserializeOwned>(url: Url, response: Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::unavailable(format!("reading {} failed: {}", url.path(), e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::invalid_response(format!("decoding {} failed: {}", url.path(), e)))
}

/// Pulls `error.message` out of a Google API error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}
