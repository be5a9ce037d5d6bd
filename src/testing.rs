//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::clock::ManualClock;
use crate::config::Settings;
use crate::engine::Engine;
use crate::error::Result;
use crate::intake::Intake;
use crate::store::{Fields, MemoryStore, Store, Transfer};
use crate::types::job::{JobSpec, Priority, Target};

pub(crate) struct Fixture {
    pub(crate) store: MemoryStore,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) engine: Engine,
    pub(crate) intake: Intake,
}

pub(crate) fn fixture(settings: Settings) -> Fixture {
    let store = MemoryStore::new();
    fixture_with(store.clone(), Arc::new(store), settings)
}

pub(crate) fn fixture_with(
    store: MemoryStore,
    shared: Arc<dyn Store>,
    settings: Settings,
) -> Fixture {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let engine = Engine::new(shared, settings).with_clock(clock.clone());
    let intake = Intake::new(engine.clone());
    Fixture {
        store,
        clock,
        engine,
        intake,
    }
}

pub(crate) fn spec(
    app: &str,
    target: Target,
    priority: u32,
    max_retries: u32,
) -> JobSpec {
    JobSpec {
        org_id: "org".into(),
        app_version_id: app.into(),
        test_path: format!("tests/{app}.spec.js"),
        priority: Priority::try_from(priority).unwrap(),
        target,
        max_retries,
    }
}

/// Delegates to a `MemoryStore`, but fails transfers of chosen members as if
/// the store had dropped the connection.
#[derive(Clone, Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryStore,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl FlakyStore {
    pub(crate) fn fail_transfers_of(&self, member: &str) {
        self.failing.lock().unwrap().insert(member.to_string());
    }
}

fn broken() -> crate::error::DispatchError {
    redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"))
        .into()
}

#[async_trait]
impl Store for FlakyStore {
    async fn read(&self, key: &str) -> Result<Option<Fields>> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.inner.write(key, fields).await
    }

    async fn insert_and_push(
        &self,
        key: &str,
        fields: &[(String, String)],
        list: &str,
        member: &str,
    ) -> Result<bool> {
        self.inner.insert_and_push(key, fields, list, member).await
    }

    async fn move_first(
        &self,
        sources: &[String],
        dest: &str,
    ) -> Result<Option<String>> {
        self.inner.move_first(sources, dest).await
    }

    async fn transfer(&self, transfer: &Transfer) -> Result<bool> {
        if self.failing.lock().unwrap().contains(&transfer.member) {
            return Err(broken());
        }
        self.inner.transfer(transfer).await
    }

    async fn push(&self, list: &str, member: &str) -> Result<()> {
        self.inner.push(list, member).await
    }

    async fn members(&self, list: &str) -> Result<Vec<String>> {
        self.inner.members(list).await
    }

    async fn len(&self, list: &str) -> Result<u64> {
        self.inner.len(list).await
    }

    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<()> {
        self.inner.schedule(set, member, score).await
    }

    async fn due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.inner.due(set, max_score, limit).await
    }

    async fn unschedule(&self, set: &str, member: &str) -> Result<bool> {
        self.inner.unschedule(set, member).await
    }

    async fn scheduled_len(&self, set: &str) -> Result<u64> {
        self.inner.scheduled_len(set).await
    }

    async fn ring(&self, bell: &str) -> Result<()> {
        self.inner.ring(bell).await
    }

    async fn wait(&self, bell: &str, timeout: Duration) -> Result<()> {
        self.inner.wait(bell, timeout).await
    }
}
