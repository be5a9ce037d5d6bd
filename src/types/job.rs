use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::states::JobStatus;
use crate::error::ValidationError;

/// Upper bound on `max_retries` accepted at submission.
pub const MAX_RETRIES_LIMIT: u32 = 5;

/// Globally unique job identifier, assigned once at submission.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The environment a test runs against. Batching only ever compares targets
/// for equality.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Emulator,
    Device,
    /// A hosted device farm.
    #[serde(rename = "browserstack", alias = "cloud-device-farm")]
    DeviceFarm,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emulator => "emulator",
            Self::Device => "device",
            Self::DeviceFarm => "browserstack",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emulator" => Ok(Self::Emulator),
            "device" => Ok(Self::Device),
            "browserstack" | "cloud-device-farm" => Ok(Self::DeviceFarm),
            _ => Err(ValidationError::Target),
        }
    }
}

/// A priority level. Higher levels drain first.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    pub fn level(self) -> u8 {
        self.0
    }

    /// Every level, highest first. This is the order queues are drained and
    /// scanned in.
    pub fn descending() -> impl Iterator<Item = Priority> {
        (Self::MIN.0..=Self::MAX.0).rev().map(Priority)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl TryFrom<u32> for Priority {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match u8::try_from(value) {
            Ok(v) if (Self::MIN.0..=Self::MAX.0).contains(&v) => {
                Ok(Priority(v))
            },
            _ => Err(ValidationError::Priority),
        }
    }
}

impl From<Priority> for u32 {
    fn from(value: Priority) -> Self {
        value.0 as u32
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a submitter asks for. Stored verbatim as the record's JSON payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub org_id: String,
    pub app_version_id: String,
    pub test_path: String,
    #[serde(default)]
    pub priority: Priority,
    pub target: Target,
    pub max_retries: u32,
}

impl JobSpec {
    /// Checks the fields the type system doesn't already pin down.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.org_id.is_empty()
            || self.app_version_id.is_empty()
            || self.test_path.is_empty()
        {
            return Err(ValidationError::EmptyField);
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ValidationError::MaxRetries);
        }
        Ok(())
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            app_version_id: self.app_version_id.clone(),
            target: self.target,
        }
    }
}

/// Jobs sharing a key can share one install and setup, so they are batched
/// together.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct GroupKey {
    pub app_version_id: String,
    pub target: Target,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.app_version_id, self.target)
    }
}

/// A job record as read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub spec: JobSpec,
    /// Name of the priority queue the job was submitted to. Retries and
    /// recovery always return the job here.
    pub queue: String,
    pub retries_done: u32,
    pub max_retries: u32,
    /// Last worker to claim the job.
    pub worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
