//! Change-Stream Projector: tails configured MongoDB collections, projects
//! each document through a `ProjectionMapper`, and checkpoints progress so
//! a restart resumes instead of replaying from the beginning.
//!
//! Leader election and the operational HTTP surface compose over this
//! crate at the binary's entry point, the same split fc-router uses for
//! `fc-config`/`fc-standby` -- only the primary replica should be tailing
//! streams, but this crate stays testable without a Redis lock.

pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod projection;
pub mod watcher;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, MongoCheckpointStore};
pub use config::StreamConfig;
pub use dispatcher::{BatchDispatcher, CheckpointTracker, StreamState};
pub use error::{Result, StreamError};
pub use projection::{DispatchJobProjectionMapper, IndexInstaller, PassthroughMapper, ProjectionMapper};
pub use watcher::{ChangeStreamWatcher, StreamWatcher};

use std::sync::Arc;

/// One running stream: its watcher task handle and the dispatcher it feeds,
/// kept together so the processor can report health and drain on shutdown.
pub struct RunningStream {
    pub config: StreamConfig,
    pub dispatcher: Arc<BatchDispatcher>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl RunningStream {
    pub fn status(&self) -> fc_common::WatcherStatus {
        fc_common::WatcherStatus {
            name: self.config.name.clone(),
            running: self.dispatcher.state() == StreamState::Running,
            has_fatal_error: self.dispatcher.tracker().has_fatal_error(),
            batches_processed: self.dispatcher.batches_processed(),
            checkpointed_seq: self.dispatcher.tracker().checkpointed_seq(),
            in_flight: self.dispatcher.tracker().in_flight() as u32,
            available_slots: self.dispatcher.available_slots() as u32,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Owns every configured stream's watcher and dispatcher. Spawning is
/// separated from construction so a caller can install projection indexes
/// first via `IndexInstaller`.
pub struct StreamProcessor {
    streams: Vec<RunningStream>,
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self { streams: Vec::new() }
    }

    /// Installs indexes for every mapper, then spawns a watcher task per
    /// stream. Each watcher runs its own reconnect loop; a fatal error
    /// inside one stream does not affect the others.
    pub async fn spawn(
        &mut self,
        client: mongodb::Client,
        db: mongodb::Database,
        streams: Vec<(StreamConfig, Arc<dyn ProjectionMapper>)>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Result<()> {
        let mappers: Vec<Arc<dyn ProjectionMapper>> = streams.iter().map(|(_, m)| m.clone()).collect();
        IndexInstaller::new(db.clone()).install(&mappers).await?;

        for (config, mapper) in streams {
            let dispatcher = Arc::new(BatchDispatcher::new(
                db.clone(),
                mapper,
                config.max_concurrent_batches,
                checkpoint_store.clone(),
                config.checkpoint_key(),
            ));

            let watcher = ChangeStreamWatcher::new(client.clone(), config.clone(), checkpoint_store.clone(), dispatcher.clone());
            let stream_name = config.name.clone();
            let handle = tokio::spawn(async move {
                let result = watcher.watch().await;
                if let Err(e) = &result {
                    tracing::error!(stream = %stream_name, error = %e, "stream watcher exited fatally");
                }
                result
            });

            self.streams.push(RunningStream { config, dispatcher, handle });
        }

        Ok(())
    }

    pub fn statuses(&self) -> Vec<fc_common::WatcherStatus> {
        self.streams.iter().map(RunningStream::status).collect()
    }

    pub fn drain_all(&self) {
        for stream in &self.streams {
            stream.dispatcher.drain();
        }
    }

    pub fn any_finished(&self) -> bool {
        self.streams.iter().any(RunningStream::is_finished)
    }
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}
