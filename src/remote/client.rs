use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use url::Url;

use super::RemoteStore;
use crate::action::{Target, IDENTITY_FIELD};
use crate::config::{Config, RemoteConfig};
use crate::error::RemoteError;

/// PostgREST client for the hosted backend.
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base: Url,
  owner_column: String,
}

impl RestClient {
  pub fn new(remote: &RemoteConfig) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let token = Config::get_token()?;
    Self::with_credentials(remote, &api_key, &token)
  }

  pub fn with_credentials(remote: &RemoteConfig, api_key: &str, token: &str) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(
      "apikey",
      HeaderValue::from_str(api_key).map_err(|e| eyre!("Invalid API key: {}", e))?,
    );
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid token: {}", e))?,
    );

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(remote.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let base = Url::parse(&remote.url)
      .and_then(|u| u.join("rest/v1/"))
      .map_err(|e| eyre!("Invalid remote url '{}': {}", remote.url, e))?;

    Ok(Self {
      http,
      base,
      owner_column: remote.owner_column.clone(),
    })
  }

  /// URL of a table endpoint.
  fn table_url(&self, target: Target) -> Result<Url, RemoteError> {
    self
      .base
      .join(target.table())
      .map_err(|e| RemoteError::rejected(format!("invalid table url: {}", e)))
  }

  /// URL addressing one owned record.
  fn record_url(&self, target: Target, identity: &str, owner: &str) -> Result<Url, RemoteError> {
    let mut url = self.table_url(target)?;
    url
      .query_pairs_mut()
      .append_pair(IDENTITY_FIELD, &format!("eq.{}", identity))
      .append_pair(&self.owner_column, &format!("eq.{}", owner));
    Ok(url)
  }

  /// Insert payload with the owner column filled in when absent.
  fn owned_payload(&self, payload: &Value, owner: &str) -> Value {
    let mut payload = payload.clone();
    if let Value::Object(map) = &mut payload {
      map
        .entry(self.owner_column.clone())
        .or_insert_with(|| Value::String(owner.to_string()));
    }
    payload
  }

  /// Read every row of a table owned by `owner`.
  pub async fn select(&self, target: Target, owner: &str) -> Result<Value, RemoteError> {
    let mut url = self.table_url(target)?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair(&self.owner_column, &format!("eq.{}", owner));

    let response = Self::send(self.http.get(url)).await?;
    response
      .json()
      .await
      .map_err(|e| RemoteError::transient(format!("unreadable response: {}", e)))
  }

  /// URL answering connectivity probes.
  pub fn health_url(&self, path: &str) -> Result<Url> {
    let root = self.base.join("/").map_err(|e| eyre!("Invalid remote url: {}", e))?;
    root
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid health path '{}': {}", path, e))
  }

  async fn send(request: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), body.trim()))
  }
}

#[async_trait]
impl RemoteStore for RestClient {
  async fn insert(
    &self,
    target: Target,
    payload: &Value,
    owner: &str,
  ) -> Result<Option<Value>, RemoteError> {
    let request = self
      .http
      .post(self.table_url(target)?)
      .header("Prefer", "return=representation")
      .json(&self.owned_payload(payload, owner));

    let response = Self::send(request).await?;
    if response.status() == StatusCode::NO_CONTENT {
      return Ok(None);
    }

    // PostgREST answers inserts with an array of the created rows.
    let rows: Value = response.json().await.unwrap_or(Value::Null);
    let created = match &rows {
      Value::Array(items) => items.first(),
      other => Some(other),
    };

    Ok(created.and_then(|row| row.get(IDENTITY_FIELD)).cloned())
  }

  async fn update(
    &self,
    target: Target,
    identity: &str,
    payload: &Value,
    owner: &str,
  ) -> Result<(), RemoteError> {
    let request = self
      .http
      .patch(self.record_url(target, identity, owner)?)
      .json(payload);

    Self::send(request).await.map(|_| ())
  }

  async fn delete(&self, target: Target, identity: &str, owner: &str) -> Result<(), RemoteError> {
    let request = self.http.delete(self.record_url(target, identity, owner)?);

    Self::send(request).await.map(|_| ())
  }
}
