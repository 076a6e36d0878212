use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

use crate::error::{LeaseError, Result};
use crate::util::http_client;

pub fn build_url(base: &str, path: &str) -> Result<Url> {
    let base_url = Url::parse(base)
        .map_err(|err| LeaseError::Validation(format!("Invalid base URL '{base}': {err}")))?;
    base_url
        .join(path)
        .map_err(|err| LeaseError::Validation(format!("Invalid path '{path}': {err}")))
}

fn json_headers(bearer: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(token) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| LeaseError::Validation("bearer token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

fn map_request_error(err: reqwest::Error) -> LeaseError {
    if err.is_timeout() {
        LeaseError::TransportTimeout(format!("HTTP request timed out: {err}"))
    } else {
        LeaseError::Transport(format!("HTTP request failed: {err}"))
    }
}

pub async fn send_json(
    method: Method,
    url: Url,
    body: Option<Value>,
    bearer: Option<&str>,
    timeout: Duration,
) -> Result<(StatusCode, String)> {
    let client = http_client()?;
    let mut request = client
        .request(method, url)
        .headers(json_headers(bearer)?)
        .timeout(timeout);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(map_request_error)?;
    let status = response.status();
    let text = response.text().await.map_err(map_request_error)?;

    if !status.is_success() {
        return Err(LeaseError::Transport(format!("HTTP {status}: {text}")));
    }

    Ok((status, text))
}

/// POST a JSON payload to `base` + `path`, optionally with a bearer token.
/// An empty response body maps to `Value::Null`.
pub async fn post_json(
    base: &str,
    path: &str,
    payload: Value,
    bearer: Option<&str>,
    timeout: Duration,
) -> Result<Value> {
    let url = build_url(base, path)?;
    let (_, body) = send_json(Method::POST, url, Some(payload), bearer, timeout).await?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body)
        .map_err(|err| LeaseError::Transport(format!("Invalid response JSON: {err}")))
}

pub async fn get_json(base: &str, path: &str, timeout: Duration) -> Result<Value> {
    let url = build_url(base, path)?;
    let (_, body) = send_json(Method::GET, url, None, None, timeout).await?;
    serde_json::from_str(&body)
        .map_err(|err| LeaseError::Transport(format!("Invalid response JSON: {err}")))
}
