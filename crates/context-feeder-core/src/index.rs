//! Index naming, mapping bodies, and index lifecycle.
//!
//! Index names are derived from the tenant plus a domain or service path:
//!
//! ```rust
//! use context_feeder_core::index::index_name;
//!
//! assert_eq!(index_name("acme", "/"), "acme-root");
//! assert_eq!(index_name("acme", "/farm/a"), "acme-farm-a");
//! assert_eq!(index_name("Acme", "Farm1"), "acmefarm1");
//! ```
//!
//! [`IndexManager`] makes sure an index exists (with every measurement kind
//! mapped) before documents are written to it, remembering the indices it
//! has already confirmed so that the store is asked at most once per index
//! for the lifetime of a task.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::models::MeasurementKind;
use crate::store::DocumentStore;

/// Suffix used for the tenant's root path, so that the root index never
/// collides with the tenant-wide aggregate index.
pub const ROOT_SUFFIX: &str = "-root";

/// Turn a domain or service path into an index name suffix.
///
/// Path separators become hyphens. The root path (`/`) and the empty string
/// map to [`ROOT_SUFFIX`].
pub fn sanitize_scope(domain_or_path: &str) -> String {
    let trimmed = domain_or_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        ROOT_SUFFIX.to_string()
    } else {
        trimmed.replace('/', "-")
    }
}

/// Destination index for documents of `tenant` under `domain_or_path`.
pub fn index_name(tenant: &str, domain_or_path: &str) -> String {
    format!("{}{}", tenant, sanitize_scope(domain_or_path)).to_lowercase()
}

/// Tenant-wide index that mirrors every document for cross-domain queries.
pub fn aggregate_index(tenant: &str) -> String {
    tenant.to_lowercase()
}

/// Field mappings shared by every measurement kind, plus the kind's value
/// field.
pub fn kind_properties(kind: MeasurementKind) -> Value {
    let mut props = Map::new();
    for field in [
        "entity_id",
        "entity_name",
        "measurement_id",
        "measurement_dimension",
        "measurement_name",
        "sensor_kind",
        "measurement_unit",
        "domain",
    ] {
        props.insert(field.to_string(), json!({ "type": "keyword" }));
    }
    for field in ["measurement_timestamp", "received_time"] {
        props.insert(field.to_string(), json!({ "type": "date" }));
    }
    props.insert(
        kind.value_field().to_string(),
        json!({ "type": kind.value_mapping() }),
    );
    Value::Object(props)
}

/// Body for a mapping update of a single kind.
pub fn mapping_body(kind: MeasurementKind) -> Value {
    json!({ "properties": kind_properties(kind) })
}

/// Body for index creation: every kind's mapping at once.
pub fn index_body() -> Value {
    let mappings: Map<String, Value> = MeasurementKind::ALL
        .iter()
        .map(|kind| (kind.mapping_type().to_string(), mapping_body(*kind)))
        .collect();
    json!({ "mappings": mappings })
}

/// What [`IndexManager::ensure_index`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// Already confirmed earlier; the store was not contacted.
    Cached,
    /// The index existed; mappings were refreshed. `failed_kinds` counts
    /// kinds whose update was rejected.
    Updated { failed_kinds: usize },
    /// The index did not exist and was created.
    Created,
    /// Creation failed; the index stays unconfirmed and is retried next time.
    CreateFailed,
}

/// Per-task memo of indices confirmed to exist.
///
/// Entries are never invalidated: indices are assumed not to be deleted
/// out-of-band while the task runs.
#[derive(Debug, Default)]
pub struct IndexManager {
    confirmed: Mutex<HashMap<String, bool>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` has been confirmed to exist.
    pub fn is_confirmed(&self, name: &str) -> bool {
        self.lock().get(name).copied().unwrap_or(false)
    }

    /// Number of confirmed indices.
    pub fn confirmed_count(&self) -> usize {
        self.lock().values().filter(|v| **v).count()
    }

    fn confirm(&self, name: &str) {
        self.lock().insert(name.to_string(), true);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, bool>> {
        self.confirmed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure `name` exists with all kind mappings.
    ///
    /// Never fails: store errors are logged and reflected in the returned
    /// [`IndexStatus`]. A failed existence check is treated as "missing", so
    /// creation is attempted.
    pub async fn ensure_index(&self, store: &dyn DocumentStore, name: &str) -> IndexStatus {
        if self.is_confirmed(name) {
            return IndexStatus::Cached;
        }

        let exists = match store.index_exists(name).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(index = %name, error = %e, "index existence check failed");
                false
            }
        };

        if exists {
            self.confirm(name);
            info!(index = %name, "updating mappings of existing index");
            let mut failed_kinds = 0;
            for kind in MeasurementKind::ALL {
                match store
                    .put_mapping(name, kind.mapping_type(), &mapping_body(kind))
                    .await
                {
                    Ok(()) => debug!(index = %name, mapping = kind.mapping_type(), "mapping updated"),
                    Err(e) => {
                        failed_kinds += 1;
                        error!(
                            index = %name,
                            mapping = kind.mapping_type(),
                            error = %e,
                            "mapping update failed"
                        );
                    }
                }
            }
            IndexStatus::Updated { failed_kinds }
        } else {
            info!(index = %name, "creating index");
            match store.create_index(name, &index_body()).await {
                Ok(()) => {
                    self.confirm(name);
                    IndexStatus::Created
                }
                Err(e) => {
                    error!(index = %name, error = %e, "index creation failed");
                    IndexStatus::CreateFailed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[test]
    fn test_index_names() {
        assert_eq!(index_name("acme", "/"), "acme-root");
        assert_eq!(index_name("acme", ""), "acme-root");
        assert_eq!(index_name("acme", "/farm/a"), "acme-farm-a");
        assert_eq!(index_name("acme", "farm1"), "acmefarm1");
        assert_eq!(index_name("ACME", "/Farm"), "acme-farm");
        assert_ne!(index_name("acme", "/"), aggregate_index("acme"));
        assert_ne!(index_name("acme", "/"), index_name("acme", "/farm/a"));
    }

    #[test]
    fn test_index_name_deterministic() {
        assert_eq!(index_name("acme", "/x/y"), index_name("acme", "/x/y"));
    }

    #[test]
    fn test_index_body_maps_every_kind() {
        let body = index_body();
        let mappings = body["mappings"].as_object().unwrap();
        assert_eq!(mappings.len(), MeasurementKind::ALL.len());
        for kind in MeasurementKind::ALL {
            let props = &mappings[kind.mapping_type()]["properties"];
            assert_eq!(props[kind.value_field()]["type"], kind.value_mapping());
            assert_eq!(props["received_time"]["type"], "date");
            assert_eq!(props["entity_id"]["type"], "keyword");
        }
    }

    #[tokio::test]
    async fn test_missing_index_created_once() {
        let store = InMemoryStore::new();
        let manager = IndexManager::new();

        assert_eq!(manager.ensure_index(&store, "acme-root").await, IndexStatus::Created);
        assert_eq!(manager.ensure_index(&store, "acme-root").await, IndexStatus::Cached);

        assert_eq!(store.create_calls("acme-root"), 1);
        assert_eq!(store.exists_calls("acme-root"), 1);
        assert!(store.mapping_calls("acme-root").is_empty());
        assert!(manager.is_confirmed("acme-root"));
    }

    #[tokio::test]
    async fn test_existing_index_updates_every_kind_once() {
        let store = InMemoryStore::new().with_index("acme-farm");
        let manager = IndexManager::new();

        let status = manager.ensure_index(&store, "acme-farm").await;
        assert_eq!(status, IndexStatus::Updated { failed_kinds: 0 });
        manager.ensure_index(&store, "acme-farm").await;

        let mut mapped = store.mapping_calls("acme-farm");
        mapped.sort();
        let mut expected: Vec<String> = MeasurementKind::ALL
            .iter()
            .map(|k| k.mapping_type().to_string())
            .collect();
        expected.sort();
        assert_eq!(mapped, expected);
        assert_eq!(store.create_calls("acme-farm"), 0);
    }

    #[tokio::test]
    async fn test_mapping_failure_does_not_abort_other_kinds() {
        let store = InMemoryStore::new()
            .with_index("acme-farm")
            .fail_mapping("sensingGeo");
        let manager = IndexManager::new();

        let status = manager.ensure_index(&store, "acme-farm").await;
        assert_eq!(status, IndexStatus::Updated { failed_kinds: 1 });
        assert_eq!(store.mapping_calls("acme-farm").len(), MeasurementKind::ALL.len());
        assert!(manager.is_confirmed("acme-farm"));
    }

    #[tokio::test]
    async fn test_failed_creation_is_retried() {
        let store = InMemoryStore::new().fail_create("acme-root");
        let manager = IndexManager::new();

        assert_eq!(manager.ensure_index(&store, "acme-root").await, IndexStatus::CreateFailed);
        assert!(!manager.is_confirmed("acme-root"));

        store.allow_create("acme-root");
        assert_eq!(manager.ensure_index(&store, "acme-root").await, IndexStatus::Created);
        assert_eq!(store.create_calls("acme-root"), 2);
        assert_eq!(manager.confirmed_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_existence_check_attempts_creation() {
        let store = InMemoryStore::new().fail_exists("acme-x");
        let manager = IndexManager::new();
        assert_eq!(manager.ensure_index(&store, "acme-x").await, IndexStatus::Created);
    }
}
