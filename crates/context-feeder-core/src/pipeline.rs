//! Entity → document pipeline.
//!
//! ```text
//! entities ─▶ filter ─▶ attributes ─▶ classify ─▶ build ─▶ route ─▶ BulkPlan
//! ```
//!
//! [`prepare`] is pure: it does no I/O and never fails. Unsupported
//! attributes are logged, reported in [`Prepared::unsupported`], and left
//! out; every other attribute of the batch is still processed.

use tracing::error;

use crate::bulk::{BulkPlan, RoutedDoc};
use crate::classify::{classify_attribute, UnsupportedAttribute};
use crate::document::build_document;
use crate::index::{aggregate_index, index_name};
use crate::models::{Entity, EntityFilter};

/// Inputs that are fixed for one feed.
#[derive(Debug, Clone, Copy)]
pub struct FeedContext<'a> {
    pub tenant: &'a str,
    /// Task scope, used when nothing more specific is known.
    pub default_scope: &'a str,
    pub filter: &'a EntityFilter,
    /// Scope paths delivered with a push notification, if any.
    pub scope_paths: &'a [String],
}

/// Result of running a batch of entities through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Prepared {
    pub routed: Vec<RoutedDoc>,
    pub matched_entities: usize,
    pub unsupported: Vec<UnsupportedAttribute>,
}

impl Prepared {
    pub fn into_plan(self, tenant: &str) -> BulkPlan {
        BulkPlan::from_routed(aggregate_index(tenant), self.routed)
    }
}

/// Domain or path that selects the index for the `position`-th entity.
///
/// Precedence: the entity's `domain`, its `servicePath`, the notification
/// scope path at the same position (or the only one), then the task scope.
pub fn routing_key(entity: &Entity, position: usize, ctx: &FeedContext<'_>) -> String {
    let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };

    entity
        .domain()
        .and_then(non_empty)
        .or_else(|| entity.service_path().and_then(non_empty))
        .or_else(|| match ctx.scope_paths {
            [only] => Some(only.clone()),
            paths => paths.get(position).cloned(),
        })
        .unwrap_or_else(|| ctx.default_scope.to_string())
}

/// Filter, classify, and route `entities`.
pub fn prepare(entities: &[Entity], ctx: &FeedContext<'_>, received_time: &str) -> Prepared {
    let mut prepared = Prepared::default();

    for (position, entity) in entities.iter().enumerate() {
        if !ctx.filter.matches(entity) {
            continue;
        }
        prepared.matched_entities += 1;

        let index = index_name(ctx.tenant, &routing_key(entity, position, ctx));

        for (attribute_id, attribute) in entity.attributes() {
            if !ctx.filter.accepts_attribute(attribute_id) {
                continue;
            }
            match classify_attribute(&attribute) {
                Some(classified) => prepared.routed.push(RoutedDoc {
                    index: index.clone(),
                    document: build_document(
                        entity,
                        attribute_id,
                        &attribute,
                        classified,
                        received_time,
                    ),
                }),
                None => {
                    let unsupported = UnsupportedAttribute {
                        entity_id: entity.id.clone(),
                        attribute_id: attribute_id.to_string(),
                        raw_type: attribute.attr_type.clone(),
                    };
                    error!(
                        entity = %unsupported.entity_id,
                        attribute = %unsupported.attribute_id,
                        raw_type = %unsupported.raw_type,
                        "{}",
                        unsupported
                    );
                    prepared.unsupported.push(unsupported);
                }
            }
        }
    }

    prepared
}
