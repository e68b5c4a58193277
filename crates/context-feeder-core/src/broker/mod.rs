//! Context broker abstraction.
//!
//! A task needs four things from the broker: list its subscriptions, create
//! one, delete one, and fetch the current entities. [`ContextBroker`] is that
//! seam; the HTTP implementation lives in the application crate and
//! [`memory::InMemoryBroker`] backs the tests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{Entity, EntityFilter};

/// A subscription as listed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One entry of a subscription's subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EntityPattern {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "idPattern", skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

const ANY_ID: &str = ".*";

/// Subject patterns for a filter.
///
/// Ids and types combine as a cross product; a missing id filter becomes the
/// `.*` id pattern. The result is sorted so the same filter always produces
/// the same request.
pub fn entity_patterns(filter: &EntityFilter) -> Vec<EntityPattern> {
    let mut ids: Vec<&String> = filter.ids.iter().flatten().collect();
    let mut types: Vec<&String> = filter.types.iter().flatten().collect();
    ids.sort();
    types.sort();

    let id_patterns: Vec<(Option<String>, Option<String>)> = if ids.is_empty() {
        vec![(None, Some(ANY_ID.to_string()))]
    } else {
        ids.into_iter().map(|id| (Some(id.clone()), None)).collect()
    };

    let mut patterns = Vec::new();
    for (id, id_pattern) in id_patterns {
        if types.is_empty() {
            patterns.push(EntityPattern {
                id: id.clone(),
                id_pattern: id_pattern.clone(),
                entity_type: None,
            });
        }
        for t in &types {
            patterns.push(EntityPattern {
                id: id.clone(),
                id_pattern: id_pattern.clone(),
                entity_type: Some((*t).clone()),
            });
        }
    }
    patterns.sort();
    patterns
}

/// Everything needed to create a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub description: String,
    pub entities: Vec<EntityPattern>,
    pub notification_url: String,
    pub throttling_secs: Option<u64>,
}

impl SubscriptionRequest {
    /// Request body in the broker's subscription format.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "description": self.description,
            "subject": { "entities": self.entities },
            "notification": { "http": { "url": self.notification_url } },
        });
        if let Some(secs) = self.throttling_secs {
            body["throttling"] = json!(secs);
        }
        body
    }
}

/// Abstract context broker.
#[async_trait]
pub trait ContextBroker: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Create a subscription and return its id.
    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<String>;

    /// Delete a subscription. Deleting one that no longer exists succeeds.
    async fn delete_subscription(&self, id: &str) -> Result<()>;

    /// Every entity visible in the configured tenant and scope.
    async fn fetch_entities(&self) -> Result<Vec<Entity>>;
}
