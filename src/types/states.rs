use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Where a job is in its lifecycle. Each status implies a location in the
/// store: queued jobs sit in a priority queue, running jobs in a processing
/// list, queued-for-retry jobs in the delay set and failed jobs in the dead
/// letter queue. Completed jobs are in no queue at all.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JobStatus {
    Queued,
    Running,
    QueuedForRetry,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        use JobStatus::*;

        match self {
            Queued => "queued",
            Running => "running",
            QueuedForRetry => "queued_for_retry",
            Completed => "completed",
            Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnknownStatus;

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use JobStatus::*;

        Ok(match s {
            "queued" => Queued,
            "running" => Running,
            "queued_for_retry" => QueuedForRetry,
            "completed" => Completed,
            "failed" => Failed,
            _ => return Err(UnknownStatus),
        })
    }
}

// Lets job views be serialised to YAML with the same names stored in records.
impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
