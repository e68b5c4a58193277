//! NGSI v2 context broker client.
//!
//! Implements [`ContextBroker`] over HTTP. Every request carries the
//! tenant and scope headers:
//!
//! | Header | Value |
//! |--------|-------|
//! | `Fiware-Service` | tenant |
//! | `Fiware-ServicePath` | scope path |
//!
//! Entity queries are paged (`limit`/`offset`/`options=count`) and follow
//! the `Fiware-Total-Count` response header until every entity is read.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

use context_feeder_core::broker::{ContextBroker, Subscription, SubscriptionRequest};
use context_feeder_core::models::{BrokerSettings, Entity};

const SERVICE_HEADER: &str = "Fiware-Service";
const SERVICE_PATH_HEADER: &str = "Fiware-ServicePath";
const TOTAL_COUNT_HEADER: &str = "Fiware-Total-Count";
const SUBSCRIPTIONS_PATH: &str = "v2/subscriptions/";

/// Attributes requested on every entity query: the two built-ins used for
/// routing plus every user attribute.
const ENTITY_ATTRS: &str = "dateModified,servicePath,*";

pub struct NgsiBroker {
    client: reqwest::Client,
    base: String,
    tenant: String,
    scope: String,
    page_size: usize,
}

impl NgsiBroker {
    pub fn new(settings: &BrokerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            base: settings.uri.trim_end_matches('/').to_string(),
            tenant: settings.tenant.clone(),
            scope: settings.scope.clone(),
            page_size: settings.page_size,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn scoped(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(SERVICE_HEADER, &self.tenant)
            .header(SERVICE_PATH_HEADER, &self.scope)
    }
}

/// Subscription id from a `Location` header such as
/// `/v2/subscriptions/5f1e...`.
pub fn subscription_id_from_location(location: &str) -> Option<&str> {
    let (_, id) = location.rsplit_once(SUBSCRIPTIONS_PATH)?;
    let id = id.trim_end_matches('/');
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

async fn fail(what: &str, response: Response) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::anyhow!("{} failed with {}: {}", what, status, body)
}

#[async_trait]
impl ContextBroker for NgsiBroker {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let response = self
            .scoped(self.client.get(self.url("v2/subscriptions")))
            .send()
            .await
            .context("Failed to reach context broker")?;
        if !response.status().is_success() {
            return Err(fail("Subscription listing", response).await);
        }
        response
            .json()
            .await
            .context("Invalid subscription list from context broker")
    }

    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<String> {
        let response = self
            .scoped(self.client.post(self.url("v2/subscriptions")))
            .json(&request.to_body())
            .send()
            .await
            .context("Failed to reach context broker")?;
        if !response.status().is_success() {
            return Err(fail("Subscription creation", response).await);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("Subscription created without a Location header")?;
        match subscription_id_from_location(location) {
            Some(id) => Ok(id.to_string()),
            None => bail!("Unrecognized subscription location: {}", location),
        }
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        let response = self
            .scoped(
                self.client
                    .delete(self.url(&format!("{}{}", SUBSCRIPTIONS_PATH, id))),
            )
            .send()
            .await
            .context("Failed to reach context broker")?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(fail("Subscription deletion", response).await)
    }

    async fn fetch_entities(&self) -> Result<Vec<Entity>> {
        let mut entities: Vec<Entity> = Vec::new();
        let limit = self.page_size.to_string();

        loop {
            let offset = entities.len().to_string();
            let response = self
                .scoped(self.client.get(self.url("v2/entities")))
                .query(&[
                    ("attrs", ENTITY_ATTRS),
                    ("limit", limit.as_str()),
                    ("offset", offset.as_str()),
                    ("options", "count"),
                ])
                .send()
                .await
                .context("Failed to reach context broker")?;
            if !response.status().is_success() {
                return Err(fail("Entity query", response).await);
            }

            let total: Option<usize> = response
                .headers()
                .get(TOTAL_COUNT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let page: Vec<Entity> = response
                .json()
                .await
                .context("Invalid entity list from context broker")?;
            let page_len = page.len();
            entities.extend(page);

            debug!(
                tenant = %self.tenant,
                fetched = entities.len(),
                total = ?total,
                "entity page read"
            );

            let complete = match total {
                Some(total) => entities.len() >= total,
                None => true,
            };
            if complete || page_len < self.page_size || page_len == 0 {
                break;
            }
        }

        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_id_from_location() {
        assert_eq!(
            subscription_id_from_location("/v2/subscriptions/5f1e2d3c"),
            Some("5f1e2d3c")
        );
        assert_eq!(
            subscription_id_from_location("http://orion:1026/v2/subscriptions/abc/"),
            Some("abc")
        );
        assert_eq!(subscription_id_from_location("/v2/subscriptions/"), None);
        assert_eq!(subscription_id_from_location("/elsewhere"), None);
    }
}
