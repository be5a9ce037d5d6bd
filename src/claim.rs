//! The batch claim protocol.
//!
//! A claim takes the oldest job from the highest non-empty priority queue,
//! then sweeps every queue (highest first, oldest first within a queue) for
//! jobs with the same grouping key, moving each one it finds into this
//! worker's processing list until the batch is full.
//!
//! Each move is a single store transfer that only succeeds if the job is
//! still where it was seen, so two workers scanning the same queue can never
//! both take a job: the loser's transfer simply reports `false`.

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::engine::Engine;
use crate::error::{DispatchError, Result};
use crate::records::field;
use crate::store::{Dest, Source, Transfer};
use crate::types::job::{GroupKey, Job, JobId};
use crate::types::states::JobStatus;

/// Jobs claimed together. Every job shares `key`; there's always at least
/// one.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub key: GroupKey,
    pub jobs: Vec<Job>,
}

impl Batch {
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Claimer {
    engine: Engine,
    processing: String,
}

impl Claimer {
    pub fn new(engine: Engine, worker: &str) -> Self {
        let processing = engine.keys().processing(worker);
        Self { engine, processing }
    }

    /// Claims a batch, waiting for work to arrive if every queue is empty.
    /// Returns `None` only once `cancel` fires.
    pub async fn claim(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Batch>> {
        let bell = self.engine.keys().doorbell();
        loop {
            if let Some(batch) = self.try_claim().await? {
                return Ok(Some(batch));
            }
            select! {
                waited = self.engine.store().wait(
                    &bell,
                    self.engine.settings().claim_wait(),
                ) => waited?,
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    /// One non-blocking claim attempt. `None` means every queue was empty.
    ///
    /// On error, jobs already moved stay in the processing list; the caller
    /// is expected to release them.
    pub async fn try_claim(&self) -> Result<Option<Batch>> {
        let Some(first) = self.take_first().await? else {
            return Ok(None);
        };

        let key = first.spec.group_key();
        let mut jobs = vec![first];
        let max = self.engine.settings().max_batch_size;

        'scan: for queue in self.engine.keys().queues() {
            if jobs.len() >= max {
                break;
            }
            let members = self.engine.store().members(&queue).await?;
            // Members come back newest first.
            for member in members.iter().rev() {
                if jobs.len() >= max {
                    break 'scan;
                }
                let Some(job) = self.candidate(member).await? else {
                    continue;
                };
                if job.spec.group_key() != key {
                    continue;
                }

                let moved = self
                    .engine
                    .store()
                    .transfer(&Transfer {
                        member: member.clone(),
                        from: Source::List(queue.clone()),
                        to: Dest::List(self.processing.clone()),
                        record: self.engine.keys().job(&job.id),
                        fields: Vec::new(),
                    })
                    .await?;
                if moved {
                    trace!(job_id = %job.id, %queue, "sibling joined batch");
                    jobs.push(job);
                } else {
                    trace!(job_id = %job.id, "sibling claimed elsewhere");
                }
            }
        }

        debug!(%key, batch_size = jobs.len(), "claimed batch");
        Ok(Some(Batch { key, jobs }))
    }

    /// Moves the next job into the processing list and loads its record.
    /// Jobs that can't be loaded are quarantined and the next one is tried.
    async fn take_first(&self) -> Result<Option<Job>> {
        let store = self.engine.store();
        let queues = self.engine.keys().queues();
        loop {
            let Some(member) =
                store.move_first(&queues, &self.processing).await?
            else {
                return Ok(None);
            };

            let has_record = match self.engine.records().get_member(&member).await
            {
                Ok(Some(job)) => return Ok(Some(job)),
                Ok(None) => {
                    error!(job = %member, "claimed job has no record");
                    false
                },
                Err(DispatchError::MalformedRecord { reason, .. }) => {
                    error!(job = %member, %reason, "claimed job is malformed");
                    member.parse::<JobId>().is_ok()
                },
                Err(e) => return Err(e),
            };
            self.quarantine(&member, has_record).await?;
        }
    }

    /// Reads a grouping candidate. Missing and malformed records are skipped
    /// and left where they are.
    async fn candidate(&self, member: &str) -> Result<Option<Job>> {
        match self.engine.records().get_member(member).await {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => {
                debug!(job = %member, "skipping candidate without a record");
                Ok(None)
            },
            Err(DispatchError::MalformedRecord { reason, .. }) => {
                warn!(job = %member, %reason, "skipping malformed candidate");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// A job that can't be read can't be run or retried, so it goes straight
    /// to the dead letter queue for an operator to look at. An existing
    /// record is marked failed.
    async fn quarantine(&self, member: &str, has_record: bool) -> Result<()> {
        let keys = self.engine.keys();
        let (record, fields) = match member.parse::<JobId>() {
            Ok(id) if has_record => (
                keys.job(&id),
                self.engine.records().stamped(&[(
                    field::STATUS,
                    JobStatus::Failed.to_string(),
                )]),
            ),
            _ => (String::new(), Vec::new()),
        };
        self.engine
            .store()
            .transfer(&Transfer {
                member: member.to_string(),
                from: Source::List(self.processing.clone()),
                to: Dest::List(keys.dead_letter()),
                record,
                fields,
            })
            .await?;
        Ok(())
    }
}
