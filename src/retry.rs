//! Resolving a claimed batch: marking it running, completing what passed, and
//! routing each failure to either the delay set or the dead letter queue.
//!
//! Every exit from the processing list is a store transfer that also writes
//! the job's new status, so a job's status and location change together.

use tracing::{debug, error, info, warn};

use crate::claim::Batch;
use crate::engine::Engine;
use crate::error::{DispatchError, Result};
use crate::executor::{BatchOutcome, Verdict};
use crate::records::field;
use crate::store::{Dest, Source, Transfer};
use crate::types::job::JobId;
use crate::types::states::JobStatus;

/// Where a resolved job was sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// Passed; marked completed and dropped from the processing list.
    Completed,
    /// Into the delay set, to be requeued at `ready_at` (unix seconds).
    Delayed { attempt: u32, ready_at: i64 },
    DeadLettered,
    /// The job was no longer in this worker's processing list, so someone
    /// else (a janitor, usually) already moved it. Nothing was changed.
    NotHeld,
}

/// Tally of one resolution pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Resolution {
    pub completed: usize,
    pub delayed: usize,
    pub dead_lettered: usize,
    /// Jobs left in the processing list because of a store error.
    pub errors: usize,
}

#[derive(Clone, Debug)]
pub struct Resolver {
    engine: Engine,
    worker: String,
    processing: String,
}

impl Resolver {
    pub fn new(engine: Engine, worker: &str) -> Self {
        let processing = engine.keys().processing(worker);
        Self {
            engine,
            worker: worker.to_string(),
            processing,
        }
    }

    /// Marks every job in the batch as running under this worker.
    pub async fn begin(&self, batch: &Batch) -> Result<()> {
        let records = self.engine.records();
        for id in batch.ids() {
            records
                .update(
                    &id,
                    &[
                        (field::STATUS, JobStatus::Running.to_string()),
                        (field::WORKER, self.worker.clone()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Applies an executor's outcome job by job. A store error on one job is
    /// logged and doesn't stop the rest; that job stays in the processing
    /// list for recovery.
    pub async fn resolve(
        &self,
        batch: &Batch,
        outcome: &BatchOutcome,
    ) -> Resolution {
        let mut tally = Resolution::default();
        for id in batch.ids() {
            let result = match outcome.verdict(&id) {
                Verdict::Passed => self.complete(&id).await,
                Verdict::Failed => self.fail(&id).await,
            };
            self.count(&mut tally, &id.to_string(), result);
        }
        info!(
            key = %batch.key,
            completed = tally.completed,
            delayed = tally.delayed,
            dead_lettered = tally.dead_lettered,
            errors = tally.errors,
            "batch resolved"
        );
        tally
    }

    /// Treats everything still in the processing list as failed. Used when
    /// the worker hits an unexpected error mid-batch.
    pub async fn fail_all(&self) -> Result<Resolution> {
        let members = self.engine.store().members(&self.processing).await?;
        let mut tally = Resolution::default();
        for member in members {
            let result = match member.parse::<JobId>() {
                Ok(id) => self.fail(&id).await,
                Err(_) => self.dead_letter(&member, None).await,
            };
            self.count(&mut tally, &member, result);
        }
        Ok(tally)
    }

    async fn complete(&self, id: &JobId) -> Result<Route> {
        let moved = self
            .engine
            .store()
            .transfer(&Transfer {
                member: id.to_string(),
                from: Source::List(self.processing.clone()),
                to: Dest::Nowhere,
                record: self.engine.keys().job(id),
                fields: self.engine.records().stamped(&[(
                    field::STATUS,
                    JobStatus::Completed.to_string(),
                )]),
            })
            .await?;
        if moved {
            debug!(job_id = %id, "job completed");
            Ok(Route::Completed)
        } else {
            Ok(self.not_held(&id.to_string()))
        }
    }

    /// Retries a failed job after the configured delay, or dead-letters it
    /// once its retries are used up.
    pub async fn fail(&self, id: &JobId) -> Result<Route> {
        let member = id.to_string();
        let job = match self.engine.records().get(id).await {
            Ok(job) => job,
            Err(DispatchError::NotFound(_)) => {
                error!(job_id = %id, "failed job has no record");
                return self.dead_letter(&member, None).await;
            },
            Err(DispatchError::MalformedRecord { reason, .. }) => {
                error!(job_id = %id, %reason, "failed job is malformed");
                return self.dead_letter(&member, Some(id)).await;
            },
            Err(e) => return Err(e),
        };

        if job.retries_done >= job.max_retries {
            info!(
                job_id = %id,
                retries = job.retries_done,
                "retries exhausted, moving to dead letter queue"
            );
            return self.dead_letter(&member, Some(id)).await;
        }

        let attempt = job.retries_done + 1;
        let ready_at = self.engine.clock().unix()
            + self.engine.settings().retry_delay().as_secs() as i64;
        let moved = self
            .engine
            .store()
            .transfer(&Transfer {
                member: member.clone(),
                from: Source::List(self.processing.clone()),
                to: Dest::Scheduled(self.engine.keys().delayed(), ready_at),
                record: self.engine.keys().job(id),
                fields: self.engine.records().stamped(&[
                    (field::RETRIES_DONE, attempt.to_string()),
                    (field::STATUS, JobStatus::QueuedForRetry.to_string()),
                ]),
            })
            .await?;
        if !moved {
            return Ok(self.not_held(&member));
        }

        info!(
            job_id = %id,
            attempt,
            max_retries = job.max_retries,
            ready_at,
            "retry scheduled"
        );
        Ok(Route::Delayed { attempt, ready_at })
    }

    /// Moves `member` to the dead letter queue. The record is marked failed
    /// only when `id` names one that exists.
    async fn dead_letter(
        &self,
        member: &str,
        id: Option<&JobId>,
    ) -> Result<Route> {
        let keys = self.engine.keys();
        let (record, fields) = match id {
            Some(id) => (
                keys.job(id),
                self.engine
                    .records()
                    .stamped(&[(field::STATUS, JobStatus::Failed.to_string())]),
            ),
            None => (String::new(), Vec::new()),
        };
        let moved = self
            .engine
            .store()
            .transfer(&Transfer {
                member: member.to_string(),
                from: Source::List(self.processing.clone()),
                to: Dest::List(keys.dead_letter()),
                record,
                fields,
            })
            .await?;
        if moved {
            Ok(Route::DeadLettered)
        } else {
            Ok(self.not_held(member))
        }
    }

    fn not_held(&self, member: &str) -> Route {
        warn!(
            job = %member,
            worker = %self.worker,
            "job no longer held by this worker"
        );
        Route::NotHeld
    }

    fn count(
        &self,
        tally: &mut Resolution,
        member: &str,
        result: Result<Route>,
    ) {
        match result {
            Ok(Route::Completed) => tally.completed += 1,
            Ok(Route::Delayed { .. }) => tally.delayed += 1,
            Ok(Route::DeadLettered) => tally.dead_lettered += 1,
            Ok(Route::NotHeld) => debug!(job = %member, "skipped job not held"),
            Err(error) => {
                error!(%error, job = %member, "failed to resolve job");
                tally.errors += 1;
            },
        }
    }
}
