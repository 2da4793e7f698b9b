use color_eyre::{eyre::eyre, Result as EyreResult};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::error::{ApiError, Result};
use crate::config::ApiConfig;
use crate::store::{DurableStore, TOKEN_KEY};

/// Dashboard API client.
///
/// The bearer token is read from the durable store on every request, so a
/// token rotated while writes are queued is picked up by the next attempt.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  store: Arc<dyn DurableStore>,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, store: Arc<dyn DurableStore>) -> EyreResult<Self> {
    // Url::join drops the last path segment unless the base ends with '/'
    let mut base = config.base_url.trim().to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL '{}': {}", config.base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(config.request_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      store,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve an endpoint such as "/evento" against the base URL.
  pub fn url(&self, endpoint: &str) -> Result<Url> {
    self
      .base_url
      .join(endpoint.trim_start_matches('/'))
      .map_err(|source| ApiError::Endpoint {
        endpoint: endpoint.to_string(),
        source,
      })
  }

  /// Current bearer token, if any.
  pub fn token(&self) -> Option<String> {
    match self.store.get(TOKEN_KEY) {
      Ok(token) => token.filter(|t| !t.is_empty()),
      Err(e) => {
        warn!(error = %e, "Failed to read auth token, sending request without it");
        None
      }
    }
  }

  pub fn set_token(&self, token: &str) -> EyreResult<()> {
    self.store.set(TOKEN_KEY, token)
  }

  pub fn clear_token(&self) -> EyreResult<()> {
    self.store.remove(TOKEN_KEY)
  }

  /// Send a request and decode the JSON answer. Empty bodies decode to null.
  pub async fn request(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Value> {
    let url = self.url(endpoint)?;
    debug!(%method, %url, "API request");

    let mut request = self
      .http
      .request(method.clone(), url)
      .header(ACCEPT, "application/json");
    if let Some(token) = self.token() {
      request = request.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
      return Err(ApiError::Unauthorized);
    }

    let text = response.text().await?;
    if !status.is_success() {
      return Err(ApiError::Status {
        status: status.as_u16(),
        body: text,
      });
    }

    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
  }

  /// GET an endpoint into a typed value.
  pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
    let value = self.request(Method::GET, endpoint, None).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Lightweight reachability check.
  ///
  /// Any HTTP answer below 500 means the API is reachable, even a 404 or a
  /// 405 for HEAD. Transport errors and timeouts mean it is not.
  pub async fn probe(&self, path: &str, timeout: Duration) -> bool {
    let url = match self.url(path) {
      Ok(url) => url,
      Err(e) => {
        warn!(error = %e, "Invalid probe path");
        return false;
      }
    };

    match self.http.head(url).timeout(timeout).send().await {
      Ok(response) => response.status().as_u16() < 500,
      Err(e) => {
        debug!(error = %e, "Connectivity probe failed");
        false
      }
    }
  }
}
