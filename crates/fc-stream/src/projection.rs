//! Projection mappers (C10): each configured stream maps a source document
//! into a projected document stored under the same `_id`, keeping upserts
//! naturally idempotent, and declares the indexes its target collection
//! needs so the installer can create them once at startup.

use mongodb::bson::{doc, Document};
use mongodb::{Database, IndexModel};

use crate::error::{Result, StreamError};

pub trait ProjectionMapper: Send + Sync {
    fn source_collection(&self) -> &str;
    fn target_collection(&self) -> &str;

    /// Transforms a source document into the document to upsert into the
    /// target collection. `_id` is carried over by the caller, not by the
    /// mapper, so every mapper implementation gets idempotency for free.
    fn map(&self, source: &Document) -> Result<Document>;

    /// Indexes the installer creates on the target collection, beyond the
    /// implicit `_id` index. Empty by default.
    fn index_definitions(&self) -> Vec<IndexModel> {
        Vec::new()
    }
}

/// Copies the source document verbatim into the projection, stamping
/// `projectedAt` so staleness is observable. Reasonable default for streams
/// that don't need denormalization.
pub struct PassthroughMapper {
    source_collection: String,
    target_collection: String,
}

impl PassthroughMapper {
    pub fn new(source_collection: impl Into<String>, target_collection: impl Into<String>) -> Self {
        Self {
            source_collection: source_collection.into(),
            target_collection: target_collection.into(),
        }
    }
}

impl ProjectionMapper for PassthroughMapper {
    fn source_collection(&self) -> &str {
        &self.source_collection
    }

    fn target_collection(&self) -> &str {
        &self.target_collection
    }

    fn map(&self, source: &Document) -> Result<Document> {
        let mut projected = source.clone();
        projected.insert("projectedAt", mongodb::bson::DateTime::now());
        Ok(projected)
    }
}

/// Denormalizes `dispatch_jobs` documents into a read-side shape keyed by
/// pool and status, dropping internal bookkeeping fields the read side has
/// no use for. Indexes `status` and `poolCode` since dashboards filter on
/// both.
pub struct DispatchJobProjectionMapper {
    target_collection: String,
}

impl DispatchJobProjectionMapper {
    pub fn new(target_collection: impl Into<String>) -> Self {
        Self { target_collection: target_collection.into() }
    }
}

impl ProjectionMapper for DispatchJobProjectionMapper {
    fn source_collection(&self) -> &str {
        "dispatch_jobs"
    }

    fn target_collection(&self) -> &str {
        &self.target_collection
    }

    fn map(&self, source: &Document) -> Result<Document> {
        let mut projected = doc! {
            "poolCode": source.get_str("poolCode").unwrap_or_default(),
            "status": source.get_str("status").unwrap_or("UNKNOWN"),
            "attempts": source.get_i32("attempts").unwrap_or(0),
            "projectedAt": mongodb::bson::DateTime::now(),
        };
        if let Ok(group_id) = source.get_str("messageGroupId") {
            projected.insert("messageGroupId", group_id);
        }
        if let Ok(updated_at) = source.get_datetime("updatedAt") {
            projected.insert("updatedAt", *updated_at);
        }
        Ok(projected)
    }

    fn index_definitions(&self) -> Vec<IndexModel> {
        vec![
            IndexModel::builder().keys(doc! { "status": 1 }).build(),
            IndexModel::builder().keys(doc! { "poolCode": 1 }).build(),
        ]
    }
}

/// Ensures every configured mapper's indexes exist before its watcher starts
/// dispatching batches. Index creation is create-if-missing; an installer
/// never drops an index a prior deployment left behind.
pub struct IndexInstaller {
    db: Database,
}

impl IndexInstaller {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn install(&self, mappers: &[std::sync::Arc<dyn ProjectionMapper>]) -> Result<()> {
        for mapper in mappers {
            let indexes = mapper.index_definitions();
            if indexes.is_empty() {
                continue;
            }
            let collection = self.db.collection::<Document>(mapper.target_collection());
            collection
                .create_indexes(indexes, None)
                .await
                .map_err(|e| StreamError::Projection(format!(
                    "failed to create indexes on {}: {e}",
                    mapper.target_collection()
                )))?;
            tracing::info!(collection = mapper.target_collection(), "projection indexes installed");
        }
        Ok(())
    }
}

/// Upserts a mapped document into its target collection, keyed by the
/// source `_id` so re-dispatching the same document is a no-op write.
pub async fn upsert_projection(db: &Database, mapper: &dyn ProjectionMapper, source: &Document) -> Result<()> {
    let id = source
        .get("_id")
        .ok_or_else(|| StreamError::Projection("source document missing _id".to_string()))?
        .clone();

    let mut projected = mapper.map(source)?;
    projected.insert("_id", id.clone());

    let collection = db.collection::<Document>(mapper.target_collection());
    collection
        .replace_one(doc! { "_id": id }, projected, mongodb::options::ReplaceOptions::builder().upsert(true).build())
        .await
        .map_err(StreamError::Mongo)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_mapper_stamps_projected_at() {
        let mapper = PassthroughMapper::new("orders", "orders_read");
        let source = doc! { "_id": "order-1", "status": "shipped" };
        let projected = mapper.map(&source).unwrap();
        assert_eq!(projected.get_str("status").unwrap(), "shipped");
        assert!(projected.contains_key("projectedAt"));
    }

    #[test]
    fn dispatch_job_mapper_denormalizes_and_drops_internal_fields() {
        let mapper = DispatchJobProjectionMapper::new("dispatch_jobs_read");
        let source = doc! {
            "_id": "job-1",
            "poolCode": "ORDERS",
            "status": "FAILED",
            "messageGroupId": "group-1",
            "attempts": 3i32,
            "internalRetryBackoffMs": 5000i32,
        };
        let projected = mapper.map(&source).unwrap();
        assert_eq!(projected.get_str("poolCode").unwrap(), "ORDERS");
        assert_eq!(projected.get_str("status").unwrap(), "FAILED");
        assert_eq!(projected.get_i32("attempts").unwrap(), 3);
        assert!(!projected.contains_key("internalRetryBackoffMs"));
        assert_eq!(mapper.index_definitions().len(), 2);
    }
}
