//! Upstream HTTP client
//!
//! One-shot POSTs against provider endpoints, in buffered and streaming
//! flavors. Cancellation of the inbound request propagates by dropping the
//! returned future, which aborts the in-flight reqwest call.

use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("invalid provider URL: {0}")]
    InvalidUrl(String),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("read upstream response: {0}")]
    ReadBody(reqwest::Error),
}

pub type Result<T> = std::result::Result<T, UpstreamError>;

/// The fully buffered outcome of a single upstream attempt.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

fn build_request(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: Bytes,
) -> Result<reqwest::RequestBuilder> {
    reqwest::Url::parse(base_url).map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);

    let mut builder = client
        .post(&url)
        .header("content-type", "application/json")
        .body(body);
    for (key, value) in headers {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(val)) => builder = builder.header(name, val),
            _ => tracing::warn!("skipping invalid upstream header: {}", key),
        }
    }
    Ok(builder)
}

/// POST to an upstream provider and read the full response body.
pub async fn send_buffered(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: Bytes,
) -> Result<UpstreamResponse> {
    let response = build_request(client, base_url, path, headers, body)?
        .send()
        .await?;

    let status = response.status();
    let response_headers = response.headers().clone();
    let body = response.bytes().await.map_err(UpstreamError::ReadBody)?;

    Ok(UpstreamResponse {
        status,
        headers: response_headers,
        body,
    })
}

/// POST to an upstream provider and return the live response handle.
/// The caller owns the handle and is responsible for draining or dropping it.
pub async fn send_streaming(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: Bytes,
) -> Result<reqwest::Response> {
    let response = build_request(client, base_url, path, headers, body)?
        .header("accept", "text/event-stream")
        .send()
        .await?;
    Ok(response)
}
