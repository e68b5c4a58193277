//! Document store abstraction.
//!
//! The [`DocumentStore`] trait covers exactly the operations the feeding
//! pipeline needs from the search store: a connectivity probe, index
//! existence and creation, per-kind mapping updates, and bulk writes.
//!
//! Implementations must be `Send + Sync`; tasks hold them as
//! `Arc<dyn DocumentStore>`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::bulk::{BulkOperation, BulkOutcome};

/// Abstract search store backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ping`](DocumentStore::ping) | Short-timeout connectivity probe |
/// | [`index_exists`](DocumentStore::index_exists) | Check whether an index exists |
/// | [`create_index`](DocumentStore::create_index) | Create an index with mappings |
/// | [`put_mapping`](DocumentStore::put_mapping) | Update the mapping of one kind |
/// | [`bulk`](DocumentStore::bulk) | Write action/document pairs in one request |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Succeeds when the store answers.
    async fn ping(&self) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create `index` with the given body (settings and mappings).
    async fn create_index(&self, index: &str, body: &Value) -> Result<()>;

    /// Apply `body` as the mapping of `mapping_type` in `index`.
    async fn put_mapping(&self, index: &str, mapping_type: &str, body: &Value) -> Result<()>;

    /// Submit a batch. Document-level rejections are reported in the
    /// returned [`BulkOutcome`]; only a failure of the request itself is an
    /// `Err`.
    async fn bulk(&self, operations: &[BulkOperation]) -> Result<BulkOutcome>;
}
