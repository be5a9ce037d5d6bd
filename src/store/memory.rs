//! In-process store for single-process deployments and tests.
//!
//! One mutex guards all state, so every method is trivially atomic. It's never
//! held across an await.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Dest, Fields, Source, Store, Transfer};
use crate::error::Result;

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, Fields>,
    /// Front is the head (newest), back is the tail (oldest).
    lists: HashMap<String, VecDeque<String>>,
    scheduled: HashMap<String, HashMap<String, i64>>,
}

impl State {
    fn push(&mut self, list: &str, member: &str) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .push_front(member.to_string());
    }

    fn remove_from_list(&mut self, list: &str, member: &str) -> bool {
        let Some(items) = self.lists.get_mut(list) else {
            return false;
        };
        match items.iter().position(|m| m == member) {
            Some(idx) => {
                items.remove(idx);
                true
            },
            None => false,
        }
    }

    fn unschedule(&mut self, set: &str, member: &str) -> bool {
        self.scheduled
            .get_mut(set)
            .map_or(false, |s| s.remove(member).is_some())
    }

    fn write(&mut self, key: &str, fields: &[(String, String)]) {
        let record = self.records.entry(key.to_string()).or_default();
        for (k, v) in fields {
            record.insert(k.clone(), v.clone());
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    bells: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State is only ever mutated in single non-panicking steps, so a
        // poisoned lock still guards consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bell(&self, name: &str) -> Arc<Notify> {
        let mut bells = self.bells.lock().unwrap_or_else(|e| e.into_inner());
        bells.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Fields>> {
        Ok(self.state().records.get(key).filter(|r| !r.is_empty()).cloned())
    }

    async fn write(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.state().write(key, fields);
        Ok(())
    }

    async fn insert_and_push(
        &self,
        key: &str,
        fields: &[(String, String)],
        list: &str,
        member: &str,
    ) -> Result<bool> {
        let mut state = self.state();
        match state.records.entry(key.to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(v) => {
                v.insert(fields.iter().cloned().collect());
            },
        }
        state.push(list, member);
        Ok(true)
    }

    async fn move_first(
        &self,
        sources: &[String],
        dest: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        for source in sources {
            if let Some(member) =
                state.lists.get_mut(source).and_then(|l| l.pop_back())
            {
                state.push(dest, &member);
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    async fn transfer(&self, t: &Transfer) -> Result<bool> {
        let mut state = self.state();
        let removed = match &t.from {
            Source::List(list) => state.remove_from_list(list, &t.member),
            Source::Scheduled(set) => state.unschedule(set, &t.member),
        };
        if !removed {
            return Ok(false);
        }

        match &t.to {
            Dest::List(list) => state.push(list, &t.member),
            Dest::Scheduled(set, score) => {
                state
                    .scheduled
                    .entry(set.clone())
                    .or_default()
                    .insert(t.member.clone(), *score);
            },
            Dest::Nowhere => {},
        }
        if !t.fields.is_empty() {
            state.write(&t.record, &t.fields);
        }
        Ok(true)
    }

    async fn push(&self, list: &str, member: &str) -> Result<()> {
        self.state().push(list, member);
        Ok(())
    }

    async fn members(&self, list: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .lists
            .get(list)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, list: &str) -> Result<u64> {
        Ok(self.state().lists.get(list).map_or(0, |l| l.len() as u64))
    }

    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<()> {
        self.state()
            .scheduled
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state();
        let Some(entries) = state.scheduled.get(set) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, i64)> = entries
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, score)| (m, *score))
            .collect();
        // Same ordering as a sorted set: by score, then lexically.
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn unschedule(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self.state().unschedule(set, member))
    }

    async fn scheduled_len(&self, set: &str) -> Result<u64> {
        Ok(self.state().scheduled.get(set).map_or(0, |s| s.len() as u64))
    }

    async fn ring(&self, bell: &str) -> Result<()> {
        self.bell(bell).notify_one();
        Ok(())
    }

    async fn wait(&self, bell: &str, timeout: Duration) -> Result<()> {
        let bell = self.bell(bell);
        let _ = tokio::time::timeout(timeout, bell.notified()).await;
        Ok(())
    }
}
