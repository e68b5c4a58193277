//! In-memory [`ContextBroker`] for tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::Entity;

use super::{ContextBroker, Subscription, SubscriptionRequest};

#[derive(Default)]
struct State {
    entities: Vec<Entity>,
    subscriptions: Vec<(Subscription, Option<SubscriptionRequest>)>,
    next_id: usize,
    failing_fetches: usize,
    fail_subscribe: bool,
    fail_list: bool,
    fetch_calls: usize,
    deleted: Vec<String>,
}

/// Broker holding a fixed entity set and a subscription table.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_entities(self, entities: Vec<Entity>) -> Self {
        self.state().entities = entities;
        self
    }

    /// Seed a subscription created by someone else (or by an earlier run).
    pub fn with_subscription(self, id: &str, description: Option<&str>) -> Self {
        self.state().subscriptions.push((
            Subscription {
                id: id.to_string(),
                description: description.map(str::to_string),
            },
            None,
        ));
        self
    }

    /// Fail the next `count` entity fetches.
    pub fn fail_fetches(self, count: usize) -> Self {
        self.state().failing_fetches = count;
        self
    }

    pub fn fail_subscribe(self) -> Self {
        self.state().fail_subscribe = true;
        self
    }

    pub fn fail_list(self) -> Self {
        self.state().fail_list = true;
        self
    }

    pub fn set_entities(&self, entities: Vec<Entity>) {
        self.state().entities = entities;
    }

    pub fn fetch_calls(&self) -> usize {
        self.state().fetch_calls
    }

    /// Ids of live subscriptions.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.state()
            .subscriptions
            .iter()
            .map(|(s, _)| s.id.clone())
            .collect()
    }

    /// Requests of live subscriptions created through the trait.
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.state()
            .subscriptions
            .iter()
            .filter_map(|(_, r)| r.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }
}

#[async_trait]
impl ContextBroker for InMemoryBroker {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let state = self.state();
        if state.fail_list {
            bail!("subscription listing failed");
        }
        Ok(state.subscriptions.iter().map(|(s, _)| s.clone()).collect())
    }

    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<String> {
        let mut state = self.state();
        if state.fail_subscribe {
            bail!("subscription rejected");
        }
        state.next_id += 1;
        let id = format!("sub-{}", state.next_id);
        state.subscriptions.push((
            Subscription {
                id: id.clone(),
                description: Some(request.description.clone()),
            },
            Some(request.clone()),
        ));
        Ok(id)
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.subscriptions.retain(|(s, _)| s.id != id);
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn fetch_entities(&self) -> Result<Vec<Entity>> {
        let mut state = self.state();
        state.fetch_calls += 1;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            bail!("broker unreachable");
        }
        Ok(state.entities.clone())
    }
}
