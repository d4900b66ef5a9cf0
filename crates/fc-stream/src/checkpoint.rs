//! Resume-token persistence for change-stream watchers. Keys look like
//! `<watcherName>_projection`, stored in a `stream_checkpoints` collection
//! shared by every watcher in the projector.

use async_trait::async_trait;
use mongodb::bson::Document;

use crate::error::{Result, StreamError};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Document>>;
    async fn save_checkpoint(&self, key: &str, token: Document) -> Result<()>;
    /// Drops a checkpoint after a stale-resume-token error, so the next
    /// connection attempt starts the stream from "now" instead of retrying
    /// an `_id` the server has already rolled off its oplog.
    async fn clear_checkpoint(&self, key: &str) -> Result<()>;
}

pub struct MongoCheckpointStore {
    collection: mongodb::Collection<Document>,
}

impl MongoCheckpointStore {
    pub fn new(client: &mongodb::Client, db_name: &str, collection_name: &str) -> Self {
        let db = client.database(db_name);
        Self {
            collection: db.collection(collection_name),
        }
    }

    /// Fails fast if the checkpoint collection can't be reached; a stream
    /// processor treats this as fatal at startup rather than tailing blind.
    pub async fn ping(&self) -> Result<()> {
        self.collection
            .estimated_document_count(None)
            .await
            .map_err(|e| StreamError::CheckpointUnreachable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MongoCheckpointStore {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Document>> {
        let filter = mongodb::bson::doc! { "_id": key };
        let doc = self
            .collection
            .find_one(filter, None)
            .await
            .map_err(|e| StreamError::CheckpointUnreachable(e.to_string()))?;
        Ok(doc.and_then(|d| d.get_document("token").ok().cloned()))
    }

    async fn save_checkpoint(&self, key: &str, token: Document) -> Result<()> {
        let filter = mongodb::bson::doc! { "_id": key };
        let update = mongodb::bson::doc! {
            "$set": { "token": token, "updated_at": mongodb::bson::DateTime::now() }
        };
        let options = mongodb::options::UpdateOptions::builder().upsert(true).build();

        self.collection
            .update_one(filter, update, options)
            .await
            .map_err(|e| StreamError::CheckpointUnreachable(e.to_string()))?;
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<()> {
        let filter = mongodb::bson::doc! { "_id": key };
        self.collection
            .delete_one(filter, None)
            .await
            .map_err(|e| StreamError::CheckpointUnreachable(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and for a single-process embedded projector
/// that has no `stream_checkpoints` collection of its own yet.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    tokens: parking_lot::Mutex<std::collections::HashMap<String, Document>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.tokens.lock().get(key).cloned())
    }

    async fn save_checkpoint(&self, key: &str, token: Document) -> Result<()> {
        self.tokens.lock().insert(key.to_string(), token);
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<()> {
        self.tokens.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_token() {
        let store = InMemoryCheckpointStore::new();
        let token = mongodb::bson::doc! { "_data": "abc" };
        store.save_checkpoint("watcher_projection", token.clone()).await.unwrap();
        assert_eq!(store.get_checkpoint("watcher_projection").await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn clear_removes_the_token() {
        let store = InMemoryCheckpointStore::new();
        store.save_checkpoint("watcher_projection", mongodb::bson::doc! {}).await.unwrap();
        store.clear_checkpoint("watcher_projection").await.unwrap();
        assert_eq!(store.get_checkpoint("watcher_projection").await.unwrap(), None);
    }
}
