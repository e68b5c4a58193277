//! The feeding task.
//!
//! A [`Task`] owns one broker handle, one store handle, its index cache,
//! and its subscription id. Its lifecycle:
//!
//! ```text
//! Idle ──init──▶ Initializing ──▶ Polling ◀──do_period──▶ Subscribed
//!   ▲                                 │                        │
//!   └──────────── shutdown ───────────┴────────────────────────┘
//! ```
//!
//! - [`Task::init`] waits for the store to answer a ping, makes sure the
//!   tenant aggregate index exists, and deletes subscriptions left behind
//!   by an earlier run of this feeder instance.
//! - [`Task::do_period`] drops the active subscription, fetches entities,
//!   and then either writes documents (time trigger) or re-subscribes
//!   (subscription trigger).
//! - [`Task::feed`] runs a pushed entity batch through the same pipeline.
//!
//! Cycles and feeds of one task never overlap: both hold the task's cycle
//! lock while they run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use context_feeder_core::broker::{entity_patterns, ContextBroker, SubscriptionRequest};
use context_feeder_core::bulk::{BulkSummary, BulkWriter};
use context_feeder_core::document::format_received_time;
use context_feeder_core::index::{aggregate_index, IndexManager};
use context_feeder_core::models::{Entity, TaskConfig, Trigger};
use context_feeder_core::pipeline::{prepare, FeedContext};
use context_feeder_core::store::DocumentStore;

use crate::config::EndpointConfig;
use crate::elastic::ElasticStore;
use crate::error::{CycleFault, CycleResult};
use crate::ngsi::NgsiBroker;

/// Observable lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Initializing,
    /// Initialized; no subscription is standing.
    Polling,
    /// A subscription for this task is active on the broker.
    Subscribed,
}

/// What one cycle or feed did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub entities_fetched: usize,
    pub entities_matched: usize,
    pub documents_written: usize,
    pub attributes_skipped: usize,
    pub failed_items: usize,
    pub failed_requests: usize,
}

impl CycleReport {
    fn record_writes(&mut self, summary: &BulkSummary) {
        self.documents_written = summary.documents;
        self.failed_items = summary.failed_items;
        self.failed_requests = summary.failed_requests;
    }
}

/// Description a task's subscriptions carry. Subscriptions with this exact
/// description belong to this tenant on this feeder instance.
pub fn subscription_description(tenant: &str, endpoint_id: &str) -> String {
    format!("Context Feeder instance {} {}", tenant, endpoint_id)
}

/// Webhook a task's subscription notifies.
pub fn notification_url(endpoint_url: &str, cid: &str) -> String {
    format!("{}/api/update/{}", endpoint_url.trim_end_matches('/'), cid)
}

pub struct Task {
    config: TaskConfig,
    cid: String,
    description: String,
    notification_url: String,
    connect_retry: Duration,
    broker: Arc<dyn ContextBroker>,
    store: Arc<dyn DocumentStore>,
    indices: IndexManager,
    state: Mutex<TaskState>,
    subscription: Mutex<Option<String>>,
    cycle: tokio::sync::Mutex<()>,
}

impl Task {
    pub fn new(
        config: TaskConfig,
        endpoint: &EndpointConfig,
        connect_retry: Duration,
        broker: Arc<dyn ContextBroker>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let cid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            description: subscription_description(&config.broker.tenant, &endpoint.id),
            notification_url: notification_url(&endpoint.url, &cid),
            cid,
            config,
            connect_retry,
            broker,
            store,
            indices: IndexManager::new(),
            state: Mutex::new(TaskState::Idle),
            subscription: Mutex::new(None),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a task talking to the broker and store named in its config.
    pub fn connect(
        config: TaskConfig,
        endpoint: &EndpointConfig,
        connect_retry: Duration,
    ) -> Result<Self> {
        let broker = Arc::new(NgsiBroker::new(&config.broker)?);
        let store = Arc::new(ElasticStore::new(&config.store)?);
        Ok(Self::new(config, endpoint, connect_retry, broker, store))
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn period(&self) -> Option<Duration> {
        self.config.period
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn indices(&self) -> &IndexManager {
        &self.indices
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    pub fn subscription_id(&self) -> Option<String> {
        lock(&self.subscription).clone()
    }

    fn set_state(&self, state: TaskState) {
        *lock(&self.state) = state;
    }

    fn tenant(&self) -> &str {
        &self.config.broker.tenant
    }

    /// Prepare the task for its first cycle.
    pub async fn init(&self) {
        let _cycle = self.cycle.lock().await;
        self.set_state(TaskState::Initializing);
        info!(task = %self.name(), cid = %self.cid, tenant = %self.tenant(), "initializing task");

        self.wait_for_store().await;

        let aggregate = aggregate_index(self.tenant());
        self.indices.ensure_index(self.store.as_ref(), &aggregate).await;

        self.clear_stale_subscriptions().await;
        self.set_state(TaskState::Polling);
    }

    async fn wait_for_store(&self) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.ping().await {
                Ok(()) => {
                    info!(task = %self.name(), store = %self.config.store.uri, "store reachable");
                    return;
                }
                Err(e) => {
                    warn!(
                        task = %self.name(),
                        store = %self.config.store.uri,
                        attempt,
                        error = %e,
                        "store unreachable, retrying in {:?}",
                        self.connect_retry
                    );
                    tokio::time::sleep(self.connect_retry).await;
                }
            }
        }
    }

    async fn clear_stale_subscriptions(&self) {
        let subscriptions = match self.broker.list_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!(task = %self.name(), error = %e, "could not list subscriptions");
                return;
            }
        };
        for subscription in subscriptions
            .iter()
            .filter(|s| s.description.as_deref() == Some(self.description.as_str()))
        {
            match self.broker.delete_subscription(&subscription.id).await {
                Ok(()) => info!(task = %self.name(), subscription = %subscription.id, "removed stale subscription"),
                Err(e) => warn!(
                    task = %self.name(),
                    subscription = %subscription.id,
                    error = %e,
                    "could not remove stale subscription"
                ),
            }
        }
    }

    async fn unsubscribe(&self) {
        let Some(id) = lock(&self.subscription).take() else {
            return;
        };
        match self.broker.delete_subscription(&id).await {
            Ok(()) => debug!(task = %self.name(), subscription = %id, "unsubscribed"),
            Err(e) => warn!(task = %self.name(), subscription = %id, error = %e, "unsubscribe failed"),
        }
        self.set_state(TaskState::Polling);
    }

    /// Run one cycle.
    pub async fn do_period(&self) -> CycleResult<CycleReport> {
        let _cycle = self.cycle.lock().await;
        self.unsubscribe().await;

        let entities = self
            .broker
            .fetch_entities()
            .await
            .map_err(CycleFault::Fetch)?;

        match self.config.trigger {
            Trigger::Subscription => {
                let report = CycleReport {
                    entities_fetched: entities.len(),
                    entities_matched: entities
                        .iter()
                        .filter(|e| self.config.filter.matches(e))
                        .count(),
                    ..Default::default()
                };
                self.subscribe().await?;
                Ok(report)
            }
            Trigger::Time => Ok(self.write(&entities, &[]).await),
        }
    }

    async fn subscribe(&self) -> CycleResult<()> {
        let request = SubscriptionRequest {
            description: self.description.clone(),
            entities: entity_patterns(&self.config.filter),
            notification_url: self.notification_url.clone(),
            throttling_secs: self.config.throttling.map(|t| t.as_secs()),
        };
        let id = self
            .broker
            .create_subscription(&request)
            .await
            .map_err(CycleFault::Subscribe)?;
        info!(task = %self.name(), subscription = %id, "subscribed");
        *lock(&self.subscription) = Some(id);
        self.set_state(TaskState::Subscribed);
        Ok(())
    }

    /// Feed a pushed entity batch. `scope_paths` are the service paths the
    /// notification was delivered with, positionally matching `entities`.
    pub async fn feed(&self, entities: &[Entity], scope_paths: &[String]) -> CycleReport {
        let _cycle = self.cycle.lock().await;
        self.write(entities, scope_paths).await
    }

    async fn write(&self, entities: &[Entity], scope_paths: &[String]) -> CycleReport {
        let received_time = format_received_time(Utc::now());
        let ctx = FeedContext {
            tenant: self.tenant(),
            default_scope: &self.config.broker.scope,
            filter: &self.config.filter,
            scope_paths,
        };
        let prepared = prepare(entities, &ctx, &received_time);

        let mut report = CycleReport {
            entities_fetched: entities.len(),
            entities_matched: prepared.matched_entities,
            attributes_skipped: prepared.unsupported.len(),
            ..Default::default()
        };

        let plan = prepared.into_plan(self.tenant());
        let summary = BulkWriter::new(self.store.as_ref(), &self.indices)
            .write(&plan)
            .await;
        report.record_writes(&summary);
        report
    }

    /// Drop the active subscription and return to [`TaskState::Idle`].
    pub async fn shutdown(&self) {
        let _cycle = self.cycle.lock().await;
        self.unsubscribe().await;
        self.set_state(TaskState::Idle);
        info!(task = %self.name(), cid = %self.cid, "task stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
