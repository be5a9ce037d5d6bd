//! Names of everything the engine keeps in the shared store.

use crate::types::job::{JobId, Priority};

/// Builds store key names under a namespace prefix.
#[derive(Clone, Debug)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hash holding a job's record.
    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{id}", self.namespace)
    }

    /// FIFO list of job IDs awaiting dispatch at one priority level.
    pub fn queue(&self, priority: Priority) -> String {
        format!("{}:queue:p{priority}", self.namespace)
    }

    /// Every priority queue, highest level first.
    pub fn queues(&self) -> Vec<String> {
        Priority::descending().map(|p| self.queue(p)).collect()
    }

    /// List of job IDs claimed by one worker and not yet resolved.
    pub fn processing(&self, worker: &str) -> String {
        format!("{}:processing:{worker}", self.namespace)
    }

    /// Sorted set of jobs waiting out a retry delay, scored by ready-at time.
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.namespace)
    }

    /// List of jobs that exhausted their retries. Only an operator drains it.
    pub fn dead_letter(&self) -> String {
        format!("{}:dead_letter", self.namespace)
    }

    /// Sorted set of worker identities scored by their last heartbeat.
    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    /// Wake-up list rung on every push to a priority queue.
    pub fn doorbell(&self) -> String {
        format!("{}:doorbell", self.namespace)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Keys::new("batchq")
    }
}
