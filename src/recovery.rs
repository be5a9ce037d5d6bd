//! Crash recovery: returning jobs stranded in a worker's processing list to
//! the queues they came from.
//!
//! A worker recovers its own list at startup. Live workers also heartbeat into
//! a registry, and a janitor recovers the lists of workers that stopped
//! heartbeating, which covers crashed workers that never come back under the
//! same identity.

use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::records::field;
use crate::store::{Dest, Source, Transfer};
use crate::types::states::JobStatus;

/// Moves every job in `worker`'s processing list back to its origin queue as
/// `queued`. Retry counters are left alone. Members without a record or an
/// origin queue stay where they are. Returns how many jobs were moved.
pub async fn recover(engine: &Engine, worker: &str) -> Result<usize> {
    let store = engine.store();
    let keys = engine.keys();
    let processing = keys.processing(worker);

    let mut recovered = 0;
    for member in store.members(&processing).await?.into_iter().rev() {
        let Some((id, queue)) = engine.records().origin_queue(&member).await?
        else {
            warn!(job = %member, %worker, "leaving unrecoverable job in place");
            continue;
        };

        let moved = store
            .transfer(&Transfer {
                member: member.clone(),
                from: Source::List(processing.clone()),
                to: Dest::List(queue.clone()),
                record: keys.job(&id),
                fields: engine
                    .records()
                    .stamped(&[(field::STATUS, JobStatus::Queued.to_string())]),
            })
            .await?;
        if moved {
            debug!(job_id = %id, %queue, %worker, "job recovered");
            recovered += 1;
            if let Err(error) = store.ring(&keys.doorbell()).await {
                warn!(%error, job_id = %id, "failed to ring doorbell");
            }
        }
    }

    if recovered > 0 {
        info!(%worker, recovered, "recovered orphaned jobs");
    }
    Ok(recovered)
}

/// Keeps a worker's entry in the registry fresh.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    engine: Engine,
    worker: String,
}

impl Heartbeat {
    pub fn new(engine: Engine, worker: &str) -> Self {
        Self {
            engine,
            worker: worker.to_string(),
        }
    }

    /// Records that the worker is alive as of now.
    pub async fn beat(&self) -> Result<()> {
        let now = self.engine.clock().unix();
        self.engine
            .store()
            .schedule(&self.engine.keys().workers(), &self.worker, now)
            .await?;
        trace!(worker = %self.worker, at = now, "heartbeat sent");
        Ok(())
    }

    /// Beats immediately, then every heartbeat interval until `cancel` fires,
    /// then removes the worker from the registry. A worker that still holds
    /// jobs stays registered, so the janitor recovers them once it goes
    /// stale.
    pub async fn run(&self, cancel: &CancellationToken) {
        let mut interval =
            tokio::time::interval(self.engine.settings().heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = interval.tick() => {},
                _ = cancel.cancelled() => break,
            }
            if let Err(error) = self.beat().await {
                error!(%error, worker = %self.worker, "failed to send heartbeat");
            }
        }

        let processing = self.engine.keys().processing(&self.worker);
        match self.engine.store().len(&processing).await {
            Ok(0) => {
                if let Err(error) = self.deregister().await {
                    error!(%error, worker = %self.worker, "failed to deregister");
                }
            },
            Ok(held) => {
                warn!(worker = %self.worker, held, "still holding jobs, staying registered");
            },
            Err(error) => {
                error!(%error, worker = %self.worker, "failed to check held jobs");
            },
        }
    }

    pub async fn deregister(&self) -> Result<()> {
        self.engine
            .store()
            .unschedule(&self.engine.keys().workers(), &self.worker)
            .await?;
        debug!(worker = %self.worker, "deregistered");
        Ok(())
    }
}

/// How many stale workers one janitor pass takes on.
const REAP_LIMIT: usize = 100;

/// Recovers the processing lists of workers whose heartbeats went stale.
#[derive(Clone, Debug)]
pub struct Janitor {
    engine: Engine,
}

impl Janitor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn run(&self, cancel: &CancellationToken) {
        info!("janitor started");
        let mut interval =
            tokio::time::interval(self.engine.settings().janitor_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = interval.tick() => {},
                _ = cancel.cancelled() => break,
            }
            if let Err(error) = self.reap().await {
                error!(%error, "failed to reap stale workers");
            }
        }
        info!("janitor stopped");
    }

    /// One pass: claims each stale worker by removing it from the registry,
    /// then recovers its list. Returns how many jobs were recovered.
    pub async fn reap(&self) -> Result<usize> {
        let store = self.engine.store();
        let registry = self.engine.keys().workers();
        let cutoff = self.engine.clock().unix()
            - self.engine.settings().stale_after().as_secs() as i64;

        let stale = store.due(&registry, cutoff, REAP_LIMIT).await?;
        let mut recovered = 0;
        for worker in stale {
            // Whoever removes the entry owns the recovery.
            if !store.unschedule(&registry, &worker).await? {
                continue;
            }
            warn!(%worker, "worker stopped heartbeating");
            match recover(&self.engine, &worker).await {
                Ok(n) => recovered += n,
                Err(error) => {
                    // Put the entry back so a later pass retries it.
                    error!(%error, %worker, "failed to recover stale worker");
                    store.schedule(&registry, &worker, cutoff).await?;
                },
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::claim::Claimer;
    use crate::config::Settings;
    use crate::retry::Resolver;
    use crate::store::Store;
    use crate::testing::{fixture, spec};
    use crate::types::job::Target;

    #[tokio::test]
    async fn test_recover_returns_jobs_untouched() {
        let f = fixture(Settings::default());
        let job = f
            .intake
            .submit(spec("v1", Target::Emulator, 5, 2))
            .await
            .unwrap();

        // One failed attempt, requeued by hand, then claimed again.
        let claimer = Claimer::new(f.engine.clone(), "w1");
        claimer.try_claim().await.unwrap().unwrap();
        let resolver = Resolver::new(f.engine.clone(), "w1");
        resolver.fail(&job.id).await.unwrap();
        f.store.unschedule(&f.engine.keys().delayed(), &job.id.to_string())
            .await
            .unwrap();
        f.store.push(&job.queue, &job.id.to_string()).await.unwrap();
        let batch = claimer.try_claim().await.unwrap().unwrap();
        resolver.begin(&batch).await.unwrap();

        assert_eq!(recover(&f.engine, "w1").await.unwrap(), 1);
        let record = f.intake.status(&job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.retries_done, 1);
        assert_eq!(
            f.store.members(&job.queue).await.unwrap(),
            vec![job.id.to_string()]
        );
        assert_eq!(f.store.len("batchq:processing:w1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_keeps_queue_order() {
        let f = fixture(Settings::default());
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                f.intake
                    .submit(spec("v1", Target::Device, 3, 0))
                    .await
                    .unwrap()
                    .id,
            );
        }
        Claimer::new(f.engine.clone(), "w1")
            .try_claim()
            .await
            .unwrap()
            .unwrap();

        recover(&f.engine, "w1").await.unwrap();
        let again = Claimer::new(f.engine.clone(), "w2")
            .try_claim()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.ids(), ids);
    }

    #[tokio::test]
    async fn test_recover_leaves_unknown_members() {
        let f = fixture(Settings::default());
        f.store.push("batchq:processing:w1", "ghost").await.unwrap();
        assert_eq!(recover(&f.engine, "w1").await.unwrap(), 0);
        assert_eq!(
            f.store.members("batchq:processing:w1").await.unwrap(),
            vec!["ghost"]
        );
    }

    #[tokio::test]
    async fn test_janitor_recovers_stale_workers_only() {
        let f = fixture(Settings::default());
        let stale = f
            .intake
            .submit(spec("v1", Target::Emulator, 5, 0))
            .await
            .unwrap();
        let fresh = f
            .intake
            .submit(spec("v2", Target::Emulator, 5, 0))
            .await
            .unwrap();

        Claimer::new(f.engine.clone(), "dead").try_claim().await.unwrap();
        Heartbeat::new(f.engine.clone(), "dead").beat().await.unwrap();
        f.clock.advance(chrono::Duration::seconds(45));
        Claimer::new(f.engine.clone(), "alive").try_claim().await.unwrap();
        Heartbeat::new(f.engine.clone(), "alive").beat().await.unwrap();
        f.clock.advance(chrono::Duration::seconds(20));

        let janitor = Janitor::new(f.engine.clone());
        assert_eq!(janitor.reap().await.unwrap(), 1);
        assert_eq!(
            f.store.members(&stale.queue).await.unwrap(),
            vec![stale.id.to_string()]
        );
        assert_eq!(
            f.store.members("batchq:processing:alive").await.unwrap(),
            vec![fresh.id.to_string()]
        );
        assert_eq!(f.intake.stats().await.unwrap().workers, 1);

        // A second pass finds nothing new to do.
        assert_eq!(janitor.reap().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_deregisters_on_cancel() {
        let f = fixture(Settings::default());
        let cancel = CancellationToken::new();
        let heartbeat = Heartbeat::new(f.engine.clone(), "w1");
        let task = {
            let cancel = cancel.clone();
            let heartbeat = heartbeat.clone();
            tokio::spawn(async move { heartbeat.run(&cancel).await })
        };

        // The first tick fires immediately.
        for _ in 0..100 {
            if f.intake.stats().await.unwrap().workers == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.intake.stats().await.unwrap().workers, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.intake.stats().await.unwrap().workers, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_stays_registered_while_holding_jobs() {
        let f = fixture(Settings::default());
        f.intake
            .submit(spec("v1", Target::Device, 4, 0))
            .await
            .unwrap();
        Claimer::new(f.engine.clone(), "w1")
            .try_claim()
            .await
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let heartbeat = Heartbeat::new(f.engine.clone(), "w1");
        heartbeat.beat().await.unwrap();
        heartbeat.run(&cancel).await;
        assert_eq!(f.intake.stats().await.unwrap().workers, 1);

        // Once stale, the janitor takes the held job back.
        f.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(Janitor::new(f.engine.clone()).reap().await.unwrap(), 1);
        assert_eq!(f.intake.stats().await.unwrap().workers, 0);
    }
}
