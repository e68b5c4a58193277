//! Bulk batching.
//!
//! Documents are written as (action, document) pairs. The action line names
//! the target index and the measurement kind's mapping type, and must be
//! immediately followed by its document; [`BulkOperation`] keeps the two
//! together so they cannot drift apart, and [`encode_ndjson`] emits them in
//! that order.
//!
//! [`BulkPlan`] groups routed documents by destination index and mirrors
//! every pair into the tenant-wide aggregate index. [`BulkWriter`] submits
//! one request per group and one for the aggregate, logging document-level
//! failures without treating them as errors.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::index::IndexManager;
use crate::models::{MeasurementDoc, MeasurementKind};
use crate::store::DocumentStore;

/// Target of one bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkAction {
    pub index: String,
    pub kind: MeasurementKind,
}

impl BulkAction {
    /// The action line as sent to the store.
    pub fn to_json(&self) -> Value {
        json!({
            "index": {
                "_index": self.index,
                "_type": self.kind.mapping_type(),
            }
        })
    }
}

/// An action line and the document that must follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    pub action: BulkAction,
    pub document: MeasurementDoc,
}

impl BulkOperation {
    pub fn new(index: impl Into<String>, document: MeasurementDoc) -> Self {
        Self {
            action: BulkAction {
                index: index.into(),
                kind: document.kind,
            },
            document,
        }
    }
}

/// Encode operations as newline-delimited JSON: action, document, action,
/// document, … with a trailing newline.
pub fn encode_ndjson(operations: &[BulkOperation]) -> Result<String> {
    let mut body = String::new();
    for op in operations {
        body.push_str(&serde_json::to_string(&op.action.to_json())?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&op.document)?);
        body.push('\n');
    }
    Ok(body)
}

/// Result of one bulk request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub submitted: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

impl BulkOutcome {
    /// Summarize a bulk response body (`{ "errors": bool, "items": [...] }`).
    pub fn from_response(submitted: usize, response: &Value) -> Self {
        if !response["errors"].as_bool().unwrap_or(false) {
            return Self {
                submitted,
                ..Default::default()
            };
        }

        let mut failed = 0;
        let mut first_error = None;
        for item in response["items"].as_array().into_iter().flatten() {
            let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
                continue;
            };
            if let Some(err) = result.get("error") {
                failed += 1;
                if first_error.is_none() {
                    let reason = err["reason"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| err.to_string());
                    first_error = Some(reason);
                }
            }
        }
        Self {
            submitted,
            failed,
            first_error,
        }
    }
}

/// A document together with the per-domain index it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedDoc {
    pub index: String,
    pub document: MeasurementDoc,
}

/// Operations grouped per destination index, plus the aggregate mirror.
#[derive(Debug, Clone)]
pub struct BulkPlan {
    aggregate_index: String,
    groups: Vec<(String, Vec<BulkOperation>)>,
    aggregate: Vec<BulkOperation>,
}

impl BulkPlan {
    pub fn new(aggregate_index: impl Into<String>) -> Self {
        Self {
            aggregate_index: aggregate_index.into(),
            groups: Vec::new(),
            aggregate: Vec::new(),
        }
    }

    /// Build a plan from routed documents, keeping their order.
    pub fn from_routed(aggregate_index: impl Into<String>, routed: Vec<RoutedDoc>) -> Self {
        let mut plan = Self::new(aggregate_index);
        for doc in routed {
            plan.push(doc);
        }
        plan
    }

    pub fn push(&mut self, routed: RoutedDoc) {
        self.aggregate.push(BulkOperation::new(
            self.aggregate_index.clone(),
            routed.document.clone(),
        ));
        let op = BulkOperation::new(routed.index.clone(), routed.document);
        match self.groups.iter_mut().find(|(index, _)| *index == routed.index) {
            Some((_, ops)) => ops.push(op),
            None => self.groups.push((routed.index, vec![op])),
        }
    }

    pub fn aggregate_index(&self) -> &str {
        &self.aggregate_index
    }

    /// Per-domain groups, in first-seen order.
    pub fn groups(&self) -> &[(String, Vec<BulkOperation>)] {
        &self.groups
    }

    pub fn aggregate(&self) -> &[BulkOperation] {
        &self.aggregate
    }

    /// Number of documents (not counting the aggregate mirror).
    pub fn len(&self) -> usize {
        self.aggregate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_empty()
    }
}

/// Totals across every request made for one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub requests: usize,
    pub documents: usize,
    pub failed_items: usize,
    pub failed_requests: usize,
}

/// Submits [`BulkPlan`]s, making sure each destination index exists first.
pub struct BulkWriter<'a> {
    store: &'a dyn DocumentStore,
    indices: &'a IndexManager,
}

impl<'a> BulkWriter<'a> {
    pub fn new(store: &'a dyn DocumentStore, indices: &'a IndexManager) -> Self {
        Self { store, indices }
    }

    /// Ensure indices and write every group, then the aggregate mirror.
    ///
    /// Never fails: rejected documents and failed requests are logged and
    /// counted in the summary.
    pub async fn write(&self, plan: &BulkPlan) -> BulkSummary {
        let mut summary = BulkSummary::default();
        if plan.is_empty() {
            return summary;
        }

        for (index, ops) in plan.groups() {
            self.indices.ensure_index(self.store, index).await;
            self.submit(index, ops, &mut summary).await;
        }

        self.indices
            .ensure_index(self.store, plan.aggregate_index())
            .await;
        self.submit(plan.aggregate_index(), plan.aggregate(), &mut summary)
            .await;

        summary
    }

    async fn submit(&self, index: &str, ops: &[BulkOperation], summary: &mut BulkSummary) {
        summary.requests += 1;
        summary.documents += ops.len();
        match self.store.bulk(ops).await {
            Ok(outcome) if outcome.failed > 0 => {
                summary.failed_items += outcome.failed;
                warn!(
                    index = %index,
                    submitted = outcome.submitted,
                    failed = outcome.failed,
                    reason = outcome.first_error.as_deref().unwrap_or("unknown"),
                    "bulk write completed with rejected documents"
                );
            }
            Ok(outcome) => {
                info!(index = %index, documents = outcome.submitted, "bulk write completed");
            }
            Err(e) => {
                summary.failed_requests += 1;
                error!(index = %index, documents = ops.len(), error = %e, "bulk request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn doc(entity: &str, kind: MeasurementKind, value: Value) -> MeasurementDoc {
        MeasurementDoc {
            entity_id: entity.to_string(),
            entity_name: None,
            domain: None,
            measurement_id: "m".to_string(),
            measurement_dimension: None,
            measurement_name: None,
            sensor_kind: None,
            measurement_unit: None,
            measurement_timestamp: None,
            received_time: "2024-01-01T00:00:00.000Z".to_string(),
            kind,
            value,
        }
    }

    fn routed(index: &str, entity: &str, kind: MeasurementKind) -> RoutedDoc {
        RoutedDoc {
            index: index.to_string(),
            document: doc(entity, kind, json!(1)),
        }
    }

    #[test]
    fn test_ndjson_pairs_action_then_document() {
        let ops = vec![
            BulkOperation::new("acme-a", doc("s1", MeasurementKind::Number, json!(1.5))),
            BulkOperation::new("acme-b", doc("s2", MeasurementKind::Keyword, json!("on"))),
        ];
        let body = encode_ndjson(&ops).unwrap();
        assert!(body.ends_with('\n'));
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);

        assert_eq!(lines[0]["index"]["_index"], "acme-a");
        assert_eq!(lines[0]["index"]["_type"], "sensingNumber");
        assert_eq!(lines[1]["entity_id"], "s1");
        assert_eq!(lines[1]["value"], 1.5);

        assert_eq!(lines[2]["index"]["_index"], "acme-b");
        assert_eq!(lines[2]["index"]["_type"], "sensingKeyword");
        assert_eq!(lines[3]["entity_id"], "s2");
        assert_eq!(lines[3]["keyword"], "on");
    }

    #[test]
    fn test_plan_groups_and_mirrors() {
        let plan = BulkPlan::from_routed(
            "acme",
            vec![
                routed("acme-a", "s1", MeasurementKind::Number),
                routed("acme-b", "s2", MeasurementKind::Text),
                routed("acme-a", "s3", MeasurementKind::Date),
            ],
        );

        assert_eq!(plan.len(), 3);
        let groups = plan.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "acme-a");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "acme-b");

        let aggregate = plan.aggregate();
        assert_eq!(aggregate.len(), 3);
        assert!(aggregate.iter().all(|op| op.action.index == "acme"));
        let mirrored: Vec<&str> = aggregate.iter().map(|op| op.document.entity_id.as_str()).collect();
        assert_eq!(mirrored, vec!["s1", "s2", "s3"]);

        for (_, ops) in groups {
            for op in ops {
                let twin = aggregate
                    .iter()
                    .find(|a| a.document.entity_id == op.document.entity_id)
                    .unwrap();
                assert_eq!(twin.document, op.document);
                assert_eq!(twin.action.kind, op.action.kind);
            }
        }
    }

    #[test]
    fn test_outcome_from_response() {
        let ok = BulkOutcome::from_response(2, &json!({ "errors": false, "items": [] }));
        assert_eq!(ok.failed, 0);
        assert_eq!(ok.submitted, 2);

        let partial = BulkOutcome::from_response(
            3,
            &json!({
                "errors": true,
                "items": [
                    { "index": { "status": 201 } },
                    { "index": { "status": 400, "error": { "type": "mapper_parsing_exception", "reason": "failed to parse [value]" } } },
                    { "index": { "status": 400, "error": { "type": "x" } } }
                ]
            }),
        );
        assert_eq!(partial.failed, 2);
        assert_eq!(partial.first_error.as_deref(), Some("failed to parse [value]"));
    }

    #[tokio::test]
    async fn test_writer_tolerates_rejected_documents() {
        let store = InMemoryStore::new().reject_documents_for("acme-a");
        let indices = IndexManager::new();
        let plan = BulkPlan::from_routed(
            "acme",
            vec![
                routed("acme-a", "s1", MeasurementKind::Number),
                routed("acme-b", "s2", MeasurementKind::Number),
            ],
        );

        let summary = BulkWriter::new(&store, &indices).write(&plan).await;
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.documents, 4);
        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.failed_requests, 0);

        assert_eq!(store.documents_in("acme-b").len(), 1);
        assert_eq!(store.documents_in("acme").len(), 2);
        assert!(indices.is_confirmed("acme-a"));
        assert!(indices.is_confirmed("acme"));
    }

    #[tokio::test]
    async fn test_writer_survives_failed_request() {
        let store = InMemoryStore::new().fail_bulk();
        let indices = IndexManager::new();
        let plan = BulkPlan::from_routed("acme", vec![routed("acme-a", "s1", MeasurementKind::Number)]);

        let summary = BulkWriter::new(&store, &indices).write(&plan).await;
        assert_eq!(summary.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_empty_plan_makes_no_requests() {
        let store = InMemoryStore::new();
        let indices = IndexManager::new();
        let summary = BulkWriter::new(&store, &indices)
            .write(&BulkPlan::new("acme"))
            .await;
        assert_eq!(summary, BulkSummary::default());
        assert!(store.calls().is_empty());
    }
}
