//! Submission and read-only queries: the engine's side of the front end.

use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::types::job::{Job, JobId, JobSpec, Priority};
use crate::types::protocol::QueueStats;

/// The outcome of a successful submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Submitted {
    pub id: JobId,
    pub queue: String,
}

#[derive(Clone, Debug)]
pub struct Intake {
    engine: Engine,
}

impl Intake {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Validates `spec`, then atomically records it and appends it to the
    /// queue for its priority.
    pub async fn submit(&self, spec: JobSpec) -> Result<Submitted> {
        spec.validate()?;

        let id = JobId::generate();
        let queue = self.engine.keys().queue(spec.priority);
        self.engine.records().create_queued(&id, &spec, &queue).await?;

        // The job is safely queued at this point; a missed ring only delays
        // pickup until an idle worker's wait times out.
        if let Err(error) =
            self.engine.store().ring(&self.engine.keys().doorbell()).await
        {
            warn!(%error, job_id = %id, "failed to ring doorbell");
        }

        info!(job_id = %id, %queue, key = %spec.group_key(), "job queued");
        Ok(Submitted { id, queue })
    }

    pub async fn status(&self, id: &JobId) -> Result<Job> {
        self.engine.records().get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let store = self.engine.store();
        let keys = self.engine.keys();

        let mut stats = QueueStats::default();
        for priority in Priority::descending() {
            let len = store.len(&keys.queue(priority)).await?;
            stats.ready += len;
            stats.queues.insert(format!("p{priority}"), len);
        }
        stats.delayed = store.scheduled_len(&keys.delayed()).await?;
        stats.dead_letter = store.len(&keys.dead_letter()).await?;
        stats.workers = store.scheduled_len(&keys.workers()).await?;
        Ok(stats)
    }

    /// IDs quarantined in the dead letter queue, newest first.
    pub async fn dead_letters(&self) -> Result<Vec<String>> {
        self.engine
            .store()
            .members(&self.engine.keys().dead_letter())
            .await
    }
}
