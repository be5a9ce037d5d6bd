//! The worker loop: claim a batch, run it, resolve it, repeat.

use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::claim::{Batch, Claimer};
use crate::engine::Engine;
use crate::error::Result;
use crate::executor::{BatchExecutor, BatchOutcome, Verdict};
use crate::recovery::{recover, Heartbeat};
use crate::retry::{Resolution, Resolver};

pub struct Worker {
    engine: Engine,
    id: String,
    claimer: Claimer,
    resolver: Resolver,
    executor: Arc<dyn BatchExecutor>,
}

impl Worker {
    /// A worker with a fresh random identity.
    pub fn new(engine: Engine, executor: Arc<dyn BatchExecutor>) -> Self {
        Self::with_id(engine, executor, Uuid::new_v4().to_string())
    }

    /// A worker with a fixed identity. Restarting under the same identity
    /// recovers whatever the previous process left in its processing list.
    pub fn with_id(
        engine: Engine,
        executor: Arc<dyn BatchExecutor>,
        id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            claimer: Claimer::new(engine.clone(), &id),
            resolver: Resolver::new(engine.clone(), &id),
            engine,
            id,
            executor,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until `cancel` fires. A batch that's already been claimed is
    /// always run and resolved before this returns.
    pub async fn run(&self, cancel: &CancellationToken) {
        info!(worker = %self.id, "worker started");

        // Nothing is claimed until leftovers from a previous life are back in
        // their queues.
        loop {
            match recover(&self.engine, &self.id).await {
                Ok(_) => break,
                Err(error) => {
                    error!(%error, worker = %self.id, "startup recovery failed");
                    if !self.back_off(cancel).await {
                        return;
                    }
                },
            }
        }

        // The heartbeat keeps going until the last batch is resolved. If this
        // future is dropped instead, the heartbeat is aborted with it and the
        // registry entry goes stale for the janitor.
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = {
            let heartbeat = Heartbeat::new(self.engine.clone(), &self.id);
            let cancel = heartbeat_cancel.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                heartbeat.run(&cancel).await
            }))
        };

        loop {
            match self.step(cancel).await {
                Ok(true) => {},
                Ok(false) => break,
                Err(_) => {
                    if !self.back_off(cancel).await {
                        break;
                    }
                },
            }
        }

        heartbeat_cancel.cancel();
        if let Err(error) = heartbeat.await {
            error!(%error, worker = %self.id, "heartbeat task failed");
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Claims, runs and resolves one batch. `Ok(false)` means `cancel` fired
    /// while waiting for work. On error, the processing list has already
    /// been dealt with and the caller only needs to back off.
    pub async fn step(&self, cancel: &CancellationToken) -> Result<bool> {
        let batch = match self.claimer.claim(cancel).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(false),
            Err(error) => {
                error!(%error, worker = %self.id, "claim failed");
                // Nothing has run yet, so a partial claim goes back as is.
                if let Err(error) = recover(&self.engine, &self.id).await {
                    error!(%error, worker = %self.id, "failed to release claim");
                }
                return Err(error);
            },
        };

        match self.process(&batch).await {
            Ok(tally) if tally.errors == 0 => Ok(true),
            Ok(tally) => {
                warn!(
                    worker = %self.id,
                    errors = tally.errors,
                    "jobs left unresolved, failing them"
                );
                self.fail_remaining().await;
                Ok(true)
            },
            Err(error) => {
                error!(%error, worker = %self.id, key = %batch.key, "batch failed");
                self.fail_remaining().await;
                Err(error)
            },
        }
    }

    async fn process(&self, batch: &Batch) -> Result<Resolution> {
        info!(
            worker = %self.id,
            key = %batch.key,
            batch_size = batch.len(),
            "running batch"
        );
        self.resolver.begin(batch).await?;
        let outcome = self.execute(batch).await;
        Ok(self.resolver.resolve(batch, &outcome).await)
    }

    /// Runs the executor on its own task. A panic fails the whole batch.
    async fn execute(&self, batch: &Batch) -> BatchOutcome {
        let executor = self.executor.clone();
        let owned = batch.clone();
        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            executor.execute(&owned).await
        }));
        match task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, worker = %self.id, key = %batch.key, "executor panicked");
                BatchOutcome::uniform(batch, Verdict::Failed)
            },
        }
    }

    async fn fail_remaining(&self) {
        match self.resolver.fail_all().await {
            Ok(tally) => debug!(?tally, worker = %self.id, "failed remaining jobs"),
            Err(error) => {
                error!(%error, worker = %self.id, "failed to fail remaining jobs")
            },
        }
    }

    /// Sleeps for the error backoff. Returns `false` if cancelled first.
    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        select! {
            _ = tokio::time::sleep(self.engine.settings().error_backoff()) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
