use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::{Job, JobId, Target};
use super::serialisable::WireSerialisable;
use super::states::JobStatus;
use crate::error::ValidationError;

/// A command sent by a client to the front end.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Submits one test job. Replies `SUBMITTED <id> <queue>`, or one of the
    /// `BAD_*` responses if the job is refused.
    ///
    /// On the wire:
    /// `submit <org> <app_version> <test_path> <target> <priority> <max_retries>`
    Submit {
        org_id: String,
        app_version_id: String,
        test_path: String,
        target: String,
        priority: u32,
        max_retries: u32,
    },
    /// Returns the job's record as a YAML dictionary, or `NOT_FOUND`.
    ///
    /// On the wire: `status <id>`
    Status { id: JobId },
    /// Returns queue lengths as a YAML dictionary.
    ///
    /// On the wire: `stats`
    Stats,
    /// Returns the IDs in the dead letter queue, newest first, as a YAML
    /// list.
    ///
    /// On the wire: `list-dead`
    ListDead,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All possible responses to a `Command`.
#[derive(Debug)]
pub enum Response {
    /// Indicates a server or store failure. Can be sent in response to any
    /// command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The client sent a malformed request: missing or extra arguments, a
    /// field with forbidden characters, or a number where none was expected.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// The request line exceeded the maximum length. The connection is closed
    /// after this is sent.
    ///
    /// On the wire: `LINE_TOO_LONG`.
    LineTooLong,
    /// In response to a `submit`, the target isn't one the engine knows.
    ///
    /// On the wire: `BAD_TARGET`.
    BadTarget,
    /// On the wire: `BAD_PRIORITY`.
    BadPriority,
    /// On the wire: `BAD_MAX_RETRIES`.
    BadMaxRetries,
    /// In response to a `submit`, the job was queued.
    ///
    /// On the wire: `SUBMITTED <id> <queue>`.
    Submitted { id: JobId, queue: String },
    /// In response to a `status`, no such job exists.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `status`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatus { data: JobView },
    /// In response to a `stats`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: QueueStats },
    /// In response to a `list-dead`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML *list* format.
    OkListDead { ids: Vec<String> },
}

impl From<ValidationError> for Response {
    fn from(value: ValidationError) -> Self {
        match value {
            ValidationError::Priority => Self::BadPriority,
            ValidationError::MaxRetries => Self::BadMaxRetries,
            ValidationError::Target => Self::BadTarget,
            ValidationError::EmptyField => Self::BadFormat,
        }
    }
}

/// `OK <n_bytes>\r\n<yaml>\r\n`, or `INTERNAL_ERROR` if `data` can't be
/// rendered.
fn ok_yaml<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(_) => Response::InternalError.serialise_wire(),
    }
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        use Response::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            LineTooLong => b"LINE_TOO_LONG\r\n".to_vec(),
            BadTarget => b"BAD_TARGET\r\n".to_vec(),
            BadPriority => b"BAD_PRIORITY\r\n".to_vec(),
            BadMaxRetries => b"BAD_MAX_RETRIES\r\n".to_vec(),
            Submitted { id, queue } => {
                format!("SUBMITTED {id} {queue}\r\n").into()
            },
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            OkStatus { data } => ok_yaml(data),
            OkStats { data } => ok_yaml(data),
            OkListDead { ids } => ok_yaml(ids),
        }
    }
}

impl WireSerialisable for Command {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            Command::Submit {
                org_id,
                app_version_id,
                test_path,
                target,
                priority,
                max_retries,
            } => format!(
                "submit {org_id} {app_version_id} {test_path} {target} \
                 {priority} {max_retries}\r\n"
            )
            .into(),
            Command::Status { id } => format!("status {id}\r\n").into(),
            Command::Stats => b"stats\r\n".to_vec(),
            Command::ListDead => b"list-dead\r\n".to_vec(),
            Command::Quit => b"quit\r\n".to_vec(),
        }
    }
}

/// A job as reported by `status`.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub org_id: String,
    pub app_version_id: String,
    pub test_path: String,
    pub target: Target,
    pub priority: u32,
    /// priority queue the job belongs to
    pub queue: String,
    #[serde(rename = "retries-done")]
    pub retries_done: u32,
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
    /// last worker to claim the job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(rename = "created-at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updated-at")]
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            org_id: job.spec.org_id,
            app_version_id: job.spec.app_version_id,
            test_path: job.spec.test_path,
            target: job.spec.target,
            priority: job.spec.priority.into(),
            queue: job.queue,
            retries_done: job.retries_done,
            max_retries: job.max_retries,
            worker: job.worker,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    /// ready jobs per priority queue, keyed `p1`..`p10`
    pub queues: BTreeMap<String, u64>,
    /// ready jobs across all queues
    #[serde(rename = "current-jobs-ready")]
    pub ready: u64,
    /// jobs waiting out a retry delay
    #[serde(rename = "current-jobs-delayed")]
    pub delayed: u64,
    /// jobs in the dead letter queue
    #[serde(rename = "current-jobs-dead")]
    pub dead_letter: u64,
    /// workers with a live heartbeat entry
    #[serde(rename = "current-workers")]
    pub workers: u64,
}
