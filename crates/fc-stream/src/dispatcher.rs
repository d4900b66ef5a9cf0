//! Batch Dispatcher + Checkpoint Tracker (C9): bounds how many batches a
//! stream processes concurrently, projects every document through the
//! stream's mapper, and only advances the persisted checkpoint through the
//! contiguous successful prefix of batch sequence numbers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mongodb::bson::Document;
use mongodb::Database;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use crate::projection::{upsert_projection, ProjectionMapper};

enum BatchOutcome {
    Pending,
    Complete(Document),
    Failed(String),
}

/// Tracks in-flight batch outcomes keyed by `seq` and advances the
/// persisted checkpoint only through the contiguous completed prefix, per
/// the ordered-commit invariant: batch 3 finishing before 1 and 2 must not
/// move the checkpoint past 0.
pub struct CheckpointTracker {
    checkpoint_store: Arc<dyn CheckpointStore>,
    checkpoint_key: String,
    outcomes: parking_lot::Mutex<BTreeMap<u64, BatchOutcome>>,
    next_expected: AtomicU64,
    checkpointed_seq: AtomicU64,
    has_fatal_error: AtomicBool,
}

impl CheckpointTracker {
    pub fn new(checkpoint_store: Arc<dyn CheckpointStore>, checkpoint_key: String) -> Self {
        Self {
            checkpoint_store,
            checkpoint_key,
            outcomes: parking_lot::Mutex::new(BTreeMap::new()),
            next_expected: AtomicU64::new(0),
            checkpointed_seq: AtomicU64::new(0),
            has_fatal_error: AtomicBool::new(false),
        }
    }

    fn register(&self, seq: u64) {
        self.outcomes.lock().insert(seq, BatchOutcome::Pending);
    }

    pub async fn mark_complete(&self, seq: u64, resume_token: Document) {
        {
            let mut outcomes = self.outcomes.lock();
            outcomes.insert(seq, BatchOutcome::Complete(resume_token));
        }
        self.advance().await;
    }

    pub async fn mark_failed(&self, seq: u64, error: String) {
        {
            let mut outcomes = self.outcomes.lock();
            outcomes.insert(seq, BatchOutcome::Failed(error));
        }
        self.has_fatal_error.store(true, Ordering::SeqCst);
    }

    /// Walks the contiguous prefix of resolved batches starting at
    /// `next_expected`, persisting the checkpoint through the last
    /// completed entry and stopping at the first pending or failed one.
    async fn advance(&self) {
        let mut last_token = None;
        let mut advanced_to = self.next_expected.load(Ordering::SeqCst);

        loop {
            let outcome = {
                let mut outcomes = self.outcomes.lock();
                match outcomes.remove(&advanced_to) {
                    Some(BatchOutcome::Complete(token)) => Some(token),
                    Some(other) => {
                        outcomes.insert(advanced_to, other);
                        None
                    }
                    None => None,
                }
            };

            match outcome {
                Some(token) => {
                    last_token = Some(token);
                    advanced_to += 1;
                }
                None => break,
            }
        }

        if let Some(token) = last_token {
            if let Err(e) = self.checkpoint_store.save_checkpoint(&self.checkpoint_key, token).await {
                error!(checkpoint_key = %self.checkpoint_key, error = %e, "failed to persist checkpoint");
                self.has_fatal_error.store(true, Ordering::SeqCst);
                return;
            }
            self.next_expected.store(advanced_to, Ordering::SeqCst);
            self.checkpointed_seq.store(advanced_to.saturating_sub(1), Ordering::SeqCst);
        }
    }

    pub fn has_fatal_error(&self) -> bool {
        self.has_fatal_error.load(Ordering::SeqCst)
    }

    pub fn checkpointed_seq(&self) -> u64 {
        self.checkpointed_seq.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.outcomes.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamState {
    Stopped,
    Running,
    Draining,
    Failed,
}

pub struct BatchDispatcher {
    db: Database,
    mapper: Arc<dyn ProjectionMapper>,
    semaphore: Arc<Semaphore>,
    tracker: Arc<CheckpointTracker>,
    state: parking_lot::Mutex<StreamState>,
    batches_processed: AtomicU64,
}

impl BatchDispatcher {
    pub fn new(
        db: Database,
        mapper: Arc<dyn ProjectionMapper>,
        max_concurrent_batches: u32,
        checkpoint_store: Arc<dyn CheckpointStore>,
        checkpoint_key: String,
    ) -> Self {
        Self {
            db,
            mapper,
            semaphore: Arc::new(Semaphore::new(max_concurrent_batches.max(1) as usize)),
            tracker: Arc::new(CheckpointTracker::new(checkpoint_store, checkpoint_key)),
            state: parking_lot::Mutex::new(StreamState::Stopped),
            batches_processed: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        *self.state.lock() = StreamState::Running;
    }

    pub fn drain(&self) {
        let mut state = self.state.lock();
        if *state == StreamState::Running {
            *state = StreamState::Draining;
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn tracker(&self) -> &Arc<CheckpointTracker> {
        &self.tracker
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::SeqCst)
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Hands a batch to a worker slot. Blocks the caller (the watcher's
    /// polling loop) only until a slot frees up, not until the batch
    /// finishes -- batches run concurrently up to `max_concurrent_batches`.
    pub async fn dispatch(&self, seq: u64, documents: Vec<Document>, resume_token: Document) -> Result<()> {
        self.tracker.register(seq);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        let db = self.db.clone();
        let mapper = self.mapper.clone();
        let tracker = self.tracker.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let mut failure = None;
            for doc in &documents {
                if let Err(e) = upsert_projection(&db, mapper.as_ref(), doc).await {
                    failure = Some(e.to_string());
                    break;
                }
            }

            match failure {
                None => {
                    let count = documents.len();
                    tracker.mark_complete(seq, resume_token).await;
                    info!(seq, documents = count, "batch projected");
                }
                Some(err) => {
                    warn!(seq, error = %err, "batch projection failed, halting checkpoint advance");
                    tracker.mark_failed(seq, err).await;
                }
            }
        });

        self.batches_processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::projection::PassthroughMapper;
    use mongodb::bson::doc;

    #[tokio::test]
    async fn checkpoint_advances_only_through_contiguous_prefix() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let tracker = CheckpointTracker::new(store.clone(), "watcher_projection".to_string());

        tracker.register(0);
        tracker.register(1);
        tracker.register(2);

        tracker.mark_complete(2, doc! { "_data": "2" }).await;
        assert_eq!(tracker.checkpointed_seq(), 0);
        assert_eq!(store.get_checkpoint("watcher_projection").await.unwrap(), None);

        tracker.mark_complete(0, doc! { "_data": "0" }).await;
        assert_eq!(store.get_checkpoint("watcher_projection").await.unwrap(), Some(doc! { "_data": "0" }));

        tracker.mark_complete(1, doc! { "_data": "1" }).await;
        assert_eq!(store.get_checkpoint("watcher_projection").await.unwrap(), Some(doc! { "_data": "2" }));
        assert_eq!(tracker.checkpointed_seq(), 2);
    }

    #[tokio::test]
    async fn a_failed_batch_halts_advancement_and_sets_fatal() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let tracker = CheckpointTracker::new(store, "watcher_projection".to_string());

        tracker.register(0);
        tracker.register(1);

        tracker.mark_failed(0, "boom".to_string()).await;
        tracker.mark_complete(1, doc! { "_data": "1" }).await;

        assert!(tracker.has_fatal_error());
        assert_eq!(tracker.checkpointed_seq(), 0);
    }

    #[test]
    fn mapper_name_is_sane() {
        let mapper: Arc<dyn ProjectionMapper> = Arc::new(PassthroughMapper::new("orders", "orders_read"));
        assert_eq!(mapper.source_collection(), "orders");
    }
}
