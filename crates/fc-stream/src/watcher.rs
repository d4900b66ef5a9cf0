//! Change-Stream Watcher (C8): tails a MongoDB collection's change stream,
//! batches documents by size or wait time, and hands each batch to the
//! stream's BatchDispatcher with a monotone `seq` so the checkpoint tracker
//! can commit in order.

use async_trait::async_trait;
use futures::stream::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::change_stream::event::ResumeToken;
use mongodb::options::ChangeStreamOptions;
use mongodb::{Client, Collection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::StreamConfig;
use crate::dispatcher::BatchDispatcher;
use crate::error::{Result, StreamError};

const INITIAL_BACKOFF_MS: u64 = 5000;
const MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

#[async_trait]
pub trait StreamWatcher: Send + Sync {
    /// Runs the watcher's reconnect loop until a fatal error occurs. A
    /// fatal error here means the caller should exit the process so its
    /// supervisor restarts it cleanly rather than looping on a cursor in an
    /// unrecoverable state.
    async fn watch(&self) -> Result<()>;
}

pub struct ChangeStreamWatcher {
    client: Client,
    config: StreamConfig,
    checkpoint_store: Arc<dyn CheckpointStore>,
    dispatcher: Arc<BatchDispatcher>,
    seq_counter: AtomicU64,
}

impl ChangeStreamWatcher {
    pub fn new(
        client: Client,
        config: StreamConfig,
        checkpoint_store: Arc<dyn CheckpointStore>,
        dispatcher: Arc<BatchDispatcher>,
    ) -> Self {
        Self {
            client,
            config,
            checkpoint_store,
            dispatcher,
            seq_counter: AtomicU64::new(0),
        }
    }

    async fn dispatch_batch(&self, batch: Vec<Document>, last_token: Option<ResumeToken>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let Some(token) = last_token else {
            warn!(stream = %self.config.name, "batch produced no resume token, skipping dispatch");
            return Ok(());
        };

        let token_doc = mongodb::bson::to_document(&token)
            .map_err(|e| StreamError::Bson(format!("failed to serialize resume token: {e}")))?;

        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        info!(stream = %self.config.name, seq, batch_size = batch.len(), "dispatching batch");
        self.dispatcher.dispatch(seq, batch, token_doc).await
    }

    async fn process_stream_events(
        &self,
        stream: &mut mongodb::change_stream::ChangeStream<mongodb::change_stream::event::ChangeStreamEvent<Document>>,
    ) -> Result<()> {
        let mut batch = Vec::new();
        let mut last_token = None;
        let batch_timeout = Duration::from_millis(self.config.batch_max_wait_ms);

        loop {
            if self.dispatcher.tracker().has_fatal_error() {
                if !batch.is_empty() {
                    let _ = self.dispatch_batch(std::mem::take(&mut batch), last_token.clone()).await;
                }
                return Err(StreamError::Projection(format!(
                    "stream {} halted: a downstream batch failed and checkpoint advance is stuck",
                    self.config.name
                )));
            }

            match timeout(batch_timeout, stream.next()).await {
                Ok(Some(Ok(event))) => {
                    if let Some(doc) = event.full_document {
                        batch.push(doc);
                        last_token = stream.resume_token();
                    }

                    if batch.len() >= self.config.batch_max_size as usize {
                        self.dispatch_batch(std::mem::take(&mut batch), last_token.clone()).await?;
                    }
                }
                Ok(Some(Err(e))) => {
                    if !batch.is_empty() {
                        let _ = self.dispatch_batch(std::mem::take(&mut batch), last_token.clone()).await;
                    }
                    return Err(classify_mongo_error(e));
                }
                Ok(None) => {
                    if !batch.is_empty() {
                        let _ = self.dispatch_batch(std::mem::take(&mut batch), last_token.clone()).await;
                    }
                    return Err(StreamError::StreamClosed);
                }
                Err(_) => {
                    if !batch.is_empty() {
                        self.dispatch_batch(std::mem::take(&mut batch), last_token.clone()).await?;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StreamWatcher for ChangeStreamWatcher {
    async fn watch(&self) -> Result<()> {
        let db = self.client.database(&self.config.source_database);
        let collection: Collection<Document> = db.collection(&self.config.source_collection);
        let checkpoint_key = self.config.checkpoint_key();

        self.dispatcher.start();

        let mut consecutive_failures = 0u32;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let resume_token_doc = match self.checkpoint_store.get_checkpoint(&checkpoint_key).await {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(stream = %self.config.name, error = %e, "failed to load checkpoint, starting from current position");
                    None
                }
            };

            let mut options = ChangeStreamOptions::builder()
                .full_document(Some(mongodb::options::FullDocumentType::UpdateLookup))
                .build();

            if let Some(doc) = resume_token_doc {
                info!(stream = %self.config.name, "resuming from checkpoint");
                match mongodb::bson::from_document::<ResumeToken>(doc) {
                    Ok(token) => options.resume_after = Some(token),
                    Err(e) => warn!(stream = %self.config.name, error = %e, "stored resume token is unparseable, starting from current position"),
                }
            } else {
                info!(stream = %self.config.name, "starting from current position, no checkpoint found");
            }

            let pipeline = vec![doc! { "$match": { "operationType": { "$in": &self.config.watch_operations } } }];

            let mut stream = match collection.watch(pipeline, options).await {
                Ok(s) => {
                    consecutive_failures = 0;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    info!(stream = %self.config.name, database = %self.config.source_database, collection = %self.config.source_collection, "change stream opened");
                    s
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let classified = classify_mongo_error(e);

                    if matches!(classified, StreamError::StaleResumeToken) {
                        error!(stream = %self.config.name, "resume token expired, clearing checkpoint; events may be missed");
                        let _ = self.checkpoint_store.clear_checkpoint(&checkpoint_key).await;
                        backoff_ms = INITIAL_BACKOFF_MS;
                        continue;
                    }

                    error!(stream = %self.config.name, attempt = consecutive_failures, backoff_ms, error = %classified, "failed to open change stream, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = ((backoff_ms as f64) * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS as f64) as u64;
                    continue;
                }
            };

            match self.process_stream_events(&mut stream).await {
                Ok(()) => {
                    info!(stream = %self.config.name, "change stream ended cleanly");
                    return Ok(());
                }
                Err(StreamError::Projection(_)) => {
                    // A downstream batch failure set the tracker's fatal flag; this is
                    // the state machine's RUNNING -> FAILED transition, not a transient
                    // connection error, so no reconnect is attempted.
                    return Err(StreamError::Projection(format!("stream {} failed permanently", self.config.name)));
                }
                Err(StreamError::StaleResumeToken) => {
                    consecutive_failures += 1;
                    error!(stream = %self.config.name, "resume token expired, clearing checkpoint; events may be missed");
                    let _ = self.checkpoint_store.clear_checkpoint(&checkpoint_key).await;
                    backoff_ms = INITIAL_BACKOFF_MS;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(stream = %self.config.name, attempt = consecutive_failures, backoff_ms, error = %e, "change stream error, reconnecting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = ((backoff_ms as f64) * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS as f64) as u64;
                }
            }
        }
    }
}

/// Classifies a raw mongo error, recognizing the stale-resume-token failure
/// mode (oplog history rolled off, or the server invalidated the token) so
/// callers can reopen the stream from scratch instead of retrying with
/// backoff against a cursor that will never reconnect.
fn classify_mongo_error(e: mongodb::error::Error) -> StreamError {
    if is_stale_resume_token_message(&e.to_string()) {
        StreamError::StaleResumeToken
    } else {
        StreamError::Mongo(e)
    }
}

fn is_stale_resume_token_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    (msg.contains("changestream") && msg.contains("history"))
        || msg.contains("resume token")
        || msg.contains("oplog")
        || msg.contains("invalidate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stale_resume_token_messages() {
        assert!(is_stale_resume_token_message("ChangeStream history lost"));
        assert!(is_stale_resume_token_message("resume token was not found"));
        assert!(!is_stale_resume_token_message("connection refused"));
    }
}
