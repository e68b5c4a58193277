//! Elasticsearch REST client.
//!
//! Implements [`DocumentStore`] with two HTTP clients: a probe client with
//! a short timeout for [`ping`](DocumentStore::ping), and a request client
//! with a long timeout so that large bulk writes are not cut short.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | ping | `GET /` |
//! | index exists | `HEAD /{index}` |
//! | create index | `PUT /{index}` |
//! | update mapping | `PUT /{index}/_mapping/{type}` |
//! | bulk | `POST /_bulk` (NDJSON) |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde_json::Value;

use context_feeder_core::bulk::{encode_ndjson, BulkOperation, BulkOutcome};
use context_feeder_core::models::StoreSettings;
use context_feeder_core::store::DocumentStore;

pub struct ElasticStore {
    probe: reqwest::Client,
    client: reqwest::Client,
    base: String,
}

impl ElasticStore {
    pub fn new(settings: &StoreSettings) -> Result<Self> {
        Ok(Self {
            probe: reqwest::Client::builder()
                .timeout(settings.ping_timeout)
                .build()?,
            client: reqwest::Client::builder()
                .timeout(settings.request_timeout)
                .build()?,
            base: settings.uri.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }
}

async fn ensure_success(what: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{} failed with {}: {}", what, status, body)
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn ping(&self) -> Result<()> {
        let response = self
            .probe
            .get(self.url(""))
            .send()
            .await
            .context("Store unreachable")?;
        ensure_success("Ping", response).await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .client
            .head(self.url(index))
            .send()
            .await
            .context("Store unreachable")?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => bail!("Existence check of {} returned {}", index, other),
        }
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .put(self.url(index))
            .json(body)
            .send()
            .await
            .context("Store unreachable")?;
        ensure_success(&format!("Creation of {}", index), response).await?;
        Ok(())
    }

    async fn put_mapping(&self, index: &str, mapping_type: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("{}/_mapping/{}", index, mapping_type)))
            .json(body)
            .send()
            .await
            .context("Store unreachable")?;
        ensure_success(&format!("Mapping {} on {}", mapping_type, index), response).await?;
        Ok(())
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> Result<BulkOutcome> {
        let body = encode_ndjson(operations)?;
        let response = self
            .client
            .post(self.url("_bulk"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("Store unreachable")?;
        let response = ensure_success("Bulk write", response).await?;
        let json: Value = response
            .json()
            .await
            .context("Invalid bulk response from store")?;
        Ok(BulkOutcome::from_response(operations.len(), &json))
    }
}
