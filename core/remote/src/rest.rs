//! REST remote system for PostgREST-style hosted backends.
//!
//! Each collection maps to `{base_url}/{collection}`. Rows are filtered with
//! `column=eq.value` query parameters, and writes ask for the affected rows
//! back with `Prefer: return=representation`. Optimistic concurrency is a
//! PATCH filtered on both `id` and `updated_at`: zero affected rows with the
//! row still present means someone else wrote first.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use shopsync_common::{ConflictSignal, EntityType, Error, Fields, Result};

use crate::provider::{
    domain_columns, RemoteRecord, RemoteSystem, ID_COLUMN, IDEMPOTENCY_COLUMN, VERSION_COLUMN,
};

/// Connection settings for [`RestRemote`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// API root, e.g. `https://project.example.co/rest/v1`.
    pub base_url: String,
    /// Key sent as `apikey` and bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// Remote system over HTTP.
pub struct RestRemote {
    http: Client,
    base: Url,
    api_key: Option<String>,
}

impl RestRemote {
    /// Create a REST remote.
    ///
    /// # Errors
    /// - `base_url` is not a valid URL
    /// - HTTP client construction fails
    pub fn new(config: RestConfig) -> Result<Self> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", raw, e)))?;

        let http = Client::builder()
            .user_agent("ShopSync/0.1")
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            api_key: config.api_key,
        })
    }

    /// Endpoint of a collection.
    pub fn collection_url(&self, entity: EntityType) -> Result<Url> {
        self.base
            .join(entity.collection())
            .map_err(|e| Error::InvalidInput(format!("Invalid collection URL: {}", e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request
                .header("apikey", key)
                .header(header::AUTHORIZATION, format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<RemoteRecord>> {
        let response = self.authorize(request).send().await.map_err(transport_err)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let rows: Vec<Fields> = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))?;
        rows.into_iter().map(RemoteRecord::from_row).collect()
    }

    async fn first(&self, request: RequestBuilder) -> Result<Option<RemoteRecord>> {
        Ok(self.rows(request).await?.into_iter().next())
    }

    async fn select_eq(
        &self,
        entity: EntityType,
        column: &str,
        value: &str,
    ) -> Result<Option<RemoteRecord>> {
        let url = self.collection_url(entity)?;
        let filter = format!("eq.{}", value);
        self.first(
            self.http
                .get(url)
                .query(&[("select", "*"), (column, filter.as_str()), ("limit", "1")]),
        )
        .await
    }
}

/// Map a transport failure to a retryable error.
fn transport_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Network(err.to_string())
    }
}

/// Map a non-success HTTP status to an error class.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = format!("{} {}", status, body.trim());
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT => Error::AlreadyExists(message),
        StatusCode::REQUEST_TIMEOUT => Error::Timeout(message),
        // Expired sessions recover once the host refreshes them.
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            Error::Unavailable(message)
        }
        s if s.is_server_error() => Error::Unavailable(message),
        _ => Error::Validation(message),
    }
}

fn version_filter(version: DateTime<Utc>) -> String {
    format!("eq.{}", version.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[async_trait]
impl RemoteSystem for RestRemote {
    fn name(&self) -> &str {
        "rest"
    }

    async fn create(
        &self,
        entity: EntityType,
        fields: Fields,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteRecord> {
        let mut row = domain_columns(fields);
        if let Some(key) = idempotency_key {
            row.insert(IDEMPOTENCY_COLUMN.to_string(), Value::String(key.to_string()));
        }

        let url = self.collection_url(entity)?;
        let request = self
            .http
            .post(url)
            .header("Prefer", "return=representation")
            .json(&Value::Object(row));

        match self.first(request).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Error::Serialization(
                "Insert returned no representation".to_string(),
            )),
            // Unique violation on the key: the row is already there.
            Err(Error::AlreadyExists(msg)) => match idempotency_key {
                Some(key) => {
                    debug!("Create of {} hit existing key {}", entity, key);
                    self.find_by_idempotency_key(entity, key)
                        .await?
                        .ok_or(Error::AlreadyExists(msg))
                }
                None => Err(Error::AlreadyExists(msg)),
            },
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        patch: Fields,
        expected_version: Option<DateTime<Utc>>,
    ) -> Result<RemoteRecord> {
        let url = self.collection_url(entity)?;
        let id_filter = format!("eq.{}", remote_id);
        let mut query = vec![(ID_COLUMN.to_string(), id_filter)];
        if let Some(version) = expected_version {
            query.push((VERSION_COLUMN.to_string(), version_filter(version)));
        }

        let request = self
            .http
            .patch(url)
            .query(&query)
            .header("Prefer", "return=representation")
            .json(&Value::Object(domain_columns(patch)));

        if let Some(record) = self.first(request).await? {
            return Ok(record);
        }

        match self.get(entity, remote_id).await? {
            Some(current) => {
                warn!("Update of {} {} lost a version race", entity, remote_id);
                Err(Error::conflict(ConflictSignal {
                    entity,
                    remote_id: remote_id.to_string(),
                    remote_version: Some(current.updated_at),
                    remote: current.fields,
                }))
            }
            None => Err(Error::NotFound(format!(
                "{} {} not found remotely",
                entity, remote_id
            ))),
        }
    }

    async fn delete(&self, entity: EntityType, remote_id: &str) -> Result<()> {
        let url = self.collection_url(entity)?;
        let filter = format!("eq.{}", remote_id);
        let request = self
            .http
            .delete(url)
            .query(&[(ID_COLUMN, filter.as_str())])
            .header("Prefer", "return=representation");

        match self.first(request).await? {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!(
                "{} {} not found remotely",
                entity, remote_id
            ))),
        }
    }

    async fn get(&self, entity: EntityType, remote_id: &str) -> Result<Option<RemoteRecord>> {
        self.select_eq(entity, ID_COLUMN, remote_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        entity: EntityType,
        key: &str,
    ) -> Result<Option<RemoteRecord>> {
        self.select_eq(entity, IDEMPOTENCY_COLUMN, key).await
    }

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>> {
        let url = self.collection_url(entity)?;
        self.rows(self.http.get(url).query(&[("select", "*")])).await
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authorize(self.http.head(self.base.clone()))
            .send()
            .await
            .map_err(transport_err)?;

        if response.status().is_server_error() {
            return Err(Error::Unavailable(response.status().to_string()));
        }
        Ok(())
    }
}
