//! In-memory [`DocumentStore`] for tests.
//!
//! Records every call, keeps written documents per index, and can be told
//! to fail specific operations so that error paths can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::bulk::{BulkOperation, BulkOutcome};

use super::DocumentStore;

/// A call received by [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Ping,
    IndexExists(String),
    CreateIndex(String),
    PutMapping { index: String, mapping_type: String },
    Bulk { operations: usize },
}

#[derive(Default)]
struct State {
    indices: HashMap<String, Value>,
    calls: Vec<StoreCall>,
    batches: Vec<Vec<BulkOperation>>,
    fail_create: HashSet<String>,
    fail_exists: HashSet<String>,
    fail_mapping: HashSet<String>,
    reject_index: HashSet<String>,
    failing_pings: usize,
    fail_bulk: bool,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pretend `index` already exists.
    pub fn with_index(self, index: &str) -> Self {
        self.state().indices.insert(index.to_string(), Value::Null);
        self
    }

    pub fn fail_create(self, index: &str) -> Self {
        self.state().fail_create.insert(index.to_string());
        self
    }

    pub fn fail_exists(self, index: &str) -> Self {
        self.state().fail_exists.insert(index.to_string());
        self
    }

    /// Reject mapping updates for one mapping type, on every index.
    pub fn fail_mapping(self, mapping_type: &str) -> Self {
        self.state().fail_mapping.insert(mapping_type.to_string());
        self
    }

    /// Report every bulk item targeting `index` as failed.
    pub fn reject_documents_for(self, index: &str) -> Self {
        self.state().reject_index.insert(index.to_string());
        self
    }

    /// Fail the next `count` pings.
    pub fn fail_pings(self, count: usize) -> Self {
        self.state().failing_pings = count;
        self
    }

    /// Fail every bulk request as a whole.
    pub fn fail_bulk(self) -> Self {
        self.state().fail_bulk = true;
        self
    }

    /// Stop failing creation of `index`.
    pub fn allow_create(&self, index: &str) {
        self.state().fail_create.remove(index);
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.state().indices.contains_key(index)
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn ping_calls(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::Ping))
    }

    pub fn exists_calls(&self, index: &str) -> usize {
        self.count(|c| matches!(c, StoreCall::IndexExists(i) if i == index))
    }

    pub fn create_calls(&self, index: &str) -> usize {
        self.count(|c| matches!(c, StoreCall::CreateIndex(i) if i == index))
    }

    /// Mapping types updated on `index`, in call order.
    pub fn mapping_calls(&self, index: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::PutMapping {
                    index: i,
                    mapping_type,
                } if i == index => Some(mapping_type.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every bulk batch received, in order.
    pub fn batches(&self) -> Vec<Vec<BulkOperation>> {
        self.state().batches.clone()
    }

    /// Serialized documents written to `index`, in write order.
    pub fn documents_in(&self, index: &str) -> Vec<Value> {
        self.state()
            .batches
            .iter()
            .flatten()
            .filter(|op| op.action.index == index)
            .filter_map(|op| serde_json::to_value(&op.document).ok())
            .collect()
    }

    fn count(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::Ping);
        if state.failing_pings > 0 {
            state.failing_pings -= 1;
            bail!("store unreachable");
        }
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(StoreCall::IndexExists(index.to_string()));
        if state.fail_exists.contains(index) {
            bail!("existence check failed for {}", index);
        }
        Ok(state.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::CreateIndex(index.to_string()));
        if state.fail_create.contains(index) {
            bail!("creation rejected for {}", index);
        }
        if state.indices.contains_key(index) {
            bail!("resource_already_exists_exception: {}", index);
        }
        state.indices.insert(index.to_string(), body.clone());
        Ok(())
    }

    async fn put_mapping(&self, index: &str, mapping_type: &str, _body: &Value) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::PutMapping {
            index: index.to_string(),
            mapping_type: mapping_type.to_string(),
        });
        if state.fail_mapping.contains(mapping_type) {
            bail!("mapping {} rejected on {}", mapping_type, index);
        }
        Ok(())
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> Result<BulkOutcome> {
        let mut state = self.state();
        state.calls.push(StoreCall::Bulk {
            operations: operations.len(),
        });
        if state.fail_bulk {
            bail!("bulk request failed");
        }
        state.batches.push(operations.to_vec());

        let rejected: Vec<&BulkOperation> = operations
            .iter()
            .filter(|op| state.reject_index.contains(&op.action.index))
            .collect();
        Ok(BulkOutcome {
            submitted: operations.len(),
            failed: rejected.len(),
            first_error: rejected
                .first()
                .map(|op| format!("document rejected by {}", op.action.index)),
        })
    }
}
