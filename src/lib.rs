//! A distributed test-job dispatch engine: priority queues, batch claiming by
//! app version and target, delayed retries with a dead letter queue, and crash
//! recovery, all coordinated through a shared store.

pub mod claim;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod intake;
pub mod keys;
pub mod line_reader;
pub mod parser;
pub mod records;
pub mod recovery;
pub mod retry;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
