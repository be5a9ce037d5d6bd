//! The shared coordination store.
//!
//! Every piece of engine state lives behind [`Store`]: job records as field
//! maps, priority queues and processing lists as lists, the delay set and the
//! worker registry as sorted sets. Each method is atomic on its own; the
//! compound ones ([`Store::insert_and_push`], [`Store::move_first`] and
//! [`Store::transfer`]) are what keep a job in exactly one place at a time
//! while many workers share the store.
//!
//! Lists are pushed at the head and popped from the tail, so they behave as
//! FIFO queues and [`Store::members`] returns newest first.

mod memory;
mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
use crate::error::Result;

/// A record's fields by name.
pub type Fields = HashMap<String, String>;

/// Where a transferred member is taken from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Source {
    List(String),
    Scheduled(String),
}

/// Where a transferred member ends up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Dest {
    /// Pushed onto the head of a list.
    List(String),
    /// Added to a sorted set with the given score.
    Scheduled(String, i64),
    /// Dropped. Used when a job leaves the queues for good.
    Nowhere,
}

/// A conditional move of one member, plus a record update that's applied only
/// if the member was actually found in its source.
///
/// The removal from the source is the guard: of several concurrent transfers
/// of the same member from the same source, exactly one succeeds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transfer {
    pub member: String,
    pub from: Source,
    pub to: Dest,
    /// Key of the record to update alongside the move. Ignored when `fields`
    /// is empty.
    pub record: String,
    pub fields: Vec<(String, String)>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns all fields of a record, or `None` if it has none.
    async fn read(&self, key: &str) -> Result<Option<Fields>>;

    /// Sets the given fields, leaving others untouched.
    async fn write(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Creates a record and pushes `member` onto `list` in one step. Returns
    /// `false`, changing nothing, if the record already exists.
    async fn insert_and_push(
        &self,
        key: &str,
        fields: &[(String, String)],
        list: &str,
        member: &str,
    ) -> Result<bool>;

    /// Pops the oldest member of the first non-empty list in `sources` and
    /// pushes it onto `dest`.
    async fn move_first(
        &self,
        sources: &[String],
        dest: &str,
    ) -> Result<Option<String>>;

    async fn transfer(&self, transfer: &Transfer) -> Result<bool>;

    async fn push(&self, list: &str, member: &str) -> Result<()>;

    /// Members of a list, newest first.
    async fn members(&self, list: &str) -> Result<Vec<String>>;

    async fn len(&self, list: &str) -> Result<u64>;

    /// Adds or rescores a sorted set member.
    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<()>;

    /// Up to `limit` members scored at or below `max_score`, lowest first.
    async fn due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Removes a sorted set member, returning whether it was present.
    async fn unschedule(&self, set: &str, member: &str) -> Result<bool>;

    async fn scheduled_len(&self, set: &str) -> Result<u64>;

    /// Wakes one waiter blocked on `bell`, or leaves a wake-up for the next.
    async fn ring(&self, bell: &str) -> Result<()>;

    /// Blocks until `bell` rings or `timeout` passes. Both outcomes just mean
    /// "look again"; callers never rely on a ring being delivered.
    async fn wait(&self, bell: &str, timeout: Duration) -> Result<()>;
}
