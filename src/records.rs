//! Job records: one field map per job, keyed by its ID.
//!
//! Records are never deleted. Writers on the same job are serialised by queue
//! membership (only the holder of a job updates it), not by locking here.

use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::error::{DispatchError, Result};
use crate::store::Fields;
use crate::types::job::{Job, JobId, JobSpec};
use crate::types::states::JobStatus;

/// Field names within a record.
pub(crate) mod field {
    pub const JOB_ID: &str = "job_id";
    pub const STATUS: &str = "status";
    pub const PAYLOAD: &str = "payload";
    pub const QUEUE: &str = "queue";
    pub const RETRIES_DONE: &str = "retries_done";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const WORKER: &str = "worker";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
}

#[derive(Clone, Debug)]
pub struct JobRecords {
    engine: Engine,
}

impl JobRecords {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Writes a new record for `spec` and appends its ID to `queue` in one
    /// step, so neither is ever visible without the other.
    pub async fn create_queued(
        &self,
        id: &JobId,
        spec: &JobSpec,
        queue: &str,
    ) -> Result<()> {
        let now = self.engine.clock().now().to_rfc3339();
        let fields = vec![
            (field::JOB_ID.to_string(), id.to_string()),
            (field::STATUS.to_string(), JobStatus::Queued.to_string()),
            (field::PAYLOAD.to_string(), serde_json::to_string(spec)?),
            (field::QUEUE.to_string(), queue.to_string()),
            (field::RETRIES_DONE.to_string(), "0".to_string()),
            (field::MAX_RETRIES.to_string(), spec.max_retries.to_string()),
            (field::CREATED_AT.to_string(), now.clone()),
            (field::UPDATED_AT.to_string(), now),
        ];

        let created = self
            .engine
            .store()
            .insert_and_push(&self.key(id), &fields, queue, &id.to_string())
            .await?;
        if created {
            Ok(())
        } else {
            Err(DispatchError::DuplicateId(*id))
        }
    }

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.try_get(id).await?.ok_or(DispatchError::NotFound(*id))
    }

    /// As `get`, but a missing record is `Ok(None)` rather than an error.
    pub async fn try_get(&self, id: &JobId) -> Result<Option<Job>> {
        match self.engine.store().read(&self.key(id)).await? {
            Some(fields) => parse(&id.to_string(), &fields).map(Some),
            None => Ok(None),
        }
    }

    /// Looks up a job by the string form held in queues. Members that aren't
    /// valid IDs count as malformed.
    pub async fn get_member(&self, member: &str) -> Result<Option<Job>> {
        let id: JobId = member
            .parse()
            .map_err(|_| DispatchError::malformed(member, "not a job ID"))?;
        self.try_get(&id).await
    }

    /// The job ID and queue a member was submitted to, read without parsing
    /// the rest of the record. `None` if the member isn't a job ID, has no
    /// record, or the record has no queue.
    pub async fn origin_queue(
        &self,
        member: &str,
    ) -> Result<Option<(JobId, String)>> {
        let Ok(id) = member.parse::<JobId>() else {
            return Ok(None);
        };
        Ok(self
            .engine
            .store()
            .read(&self.key(&id))
            .await?
            .and_then(|mut fields| fields.remove(field::QUEUE))
            .filter(|queue| !queue.is_empty())
            .map(|queue| (id, queue)))
    }

    /// Partially updates a record, refreshing `updated_at`.
    pub async fn update(
        &self,
        id: &JobId,
        fields: &[(&str, String)],
    ) -> Result<()> {
        self.engine
            .store()
            .write(&self.key(id), &self.stamped(fields))
            .await
    }

    /// Owned field pairs with `updated_at` appended, ready for a store write
    /// or a transfer.
    pub(crate) fn stamped(&self, fields: &[(&str, String)]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .chain(std::iter::once((
                field::UPDATED_AT.to_string(),
                self.engine.clock().now().to_rfc3339(),
            )))
            .collect()
    }

    pub(crate) fn key(&self, id: &JobId) -> String {
        self.engine.keys().job(id)
    }
}

fn required<'a>(id: &str, fields: &'a Fields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| DispatchError::malformed(id, format!("missing {name}")))
}

fn parsed<T: std::str::FromStr>(id: &str, fields: &Fields, name: &str) -> Result<T> {
    required(id, fields, name)?
        .parse()
        .map_err(|_| DispatchError::malformed(id, format!("invalid {name}")))
}

fn timestamp(id: &str, fields: &Fields, name: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(required(id, fields, name)?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DispatchError::malformed(id, format!("invalid {name}")))
}

/// Builds a `Job` from its stored fields. Anything missing or unparsable
/// makes the whole record malformed.
pub(crate) fn parse(id: &str, fields: &Fields) -> Result<Job> {
    let spec: JobSpec = serde_json::from_str(required(id, fields, field::PAYLOAD)?)
        .map_err(|e| DispatchError::malformed(id, format!("payload: {e}")))?;

    Ok(Job {
        id: parsed(id, fields, field::JOB_ID)?,
        status: parsed(id, fields, field::STATUS)?,
        spec,
        queue: required(id, fields, field::QUEUE)?.to_string(),
        retries_done: parsed(id, fields, field::RETRIES_DONE)?,
        max_retries: parsed(id, fields, field::MAX_RETRIES)?,
        worker: fields.get(field::WORKER).cloned(),
        created_at: timestamp(id, fields, field::CREATED_AT)?,
        updated_at: timestamp(id, fields, field::UPDATED_AT)?,
    })
}
