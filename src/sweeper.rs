//! The requeue sweeper: moves jobs whose retry delay has passed from the delay
//! set back onto the queue they were submitted to.
//!
//! Any number of sweepers can share a store. Removal from the delay set is the
//! guard on each move, so a job another sweeper got to first is just skipped.

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::records::field;
use crate::store::{Dest, Source, Transfer};
use crate::types::states::JobStatus;

#[derive(Clone, Debug)]
pub struct Requeuer {
    engine: Engine,
}

impl Requeuer {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Sweeps until `cancel` fires, sleeping for the sweep interval whenever
    /// nothing is due.
    pub async fn run(&self, cancel: &CancellationToken) {
        info!("requeuer started");
        loop {
            let pause = match self.sweep().await {
                Ok(_) => self.engine.settings().sweep_interval(),
                Err(error) => {
                    error!(%error, "requeue sweep failed");
                    self.engine.settings().error_backoff()
                },
            };
            select! {
                _ = tokio::time::sleep(pause) => {},
                _ = cancel.cancelled() => break,
            }
        }
        info!("requeuer stopped");
    }

    /// Requeues every job that's due now, earliest first, and returns how
    /// many this sweeper moved.
    pub async fn sweep(&self) -> Result<usize> {
        let delayed = self.engine.keys().delayed();
        let mut requeued = 0;
        loop {
            let now = self.engine.clock().unix();
            let due = self.engine.store().due(&delayed, now, 1).await?;
            let Some(member) = due.into_iter().next() else {
                break;
            };
            if self.requeue(&member).await? {
                requeued += 1;
            }
        }
        if requeued > 0 {
            debug!(requeued, "sweep finished");
        }
        Ok(requeued)
    }

    async fn requeue(&self, member: &str) -> Result<bool> {
        let store = self.engine.store();
        let keys = self.engine.keys();

        let Some((id, queue)) =
            self.engine.records().origin_queue(member).await?
        else {
            // It can never be requeued, and left in place it would sit at the
            // front of the delay set forever.
            error!(job = %member, "delayed job has no origin queue");
            store
                .transfer(&Transfer {
                    member: member.to_string(),
                    from: Source::Scheduled(keys.delayed()),
                    to: Dest::List(keys.dead_letter()),
                    record: String::new(),
                    fields: Vec::new(),
                })
                .await?;
            return Ok(false);
        };

        let moved = store
            .transfer(&Transfer {
                member: member.to_string(),
                from: Source::Scheduled(keys.delayed()),
                to: Dest::List(queue.clone()),
                record: keys.job(&id),
                fields: self
                    .engine
                    .records()
                    .stamped(&[(field::STATUS, JobStatus::Queued.to_string())]),
            })
            .await?;
        if !moved {
            debug!(job = %member, "delayed job already requeued elsewhere");
            return Ok(false);
        }

        info!(job_id = %id, %queue, "job requeued");
        if let Err(error) = store.ring(&keys.doorbell()).await {
            warn!(%error, job_id = %id, "failed to ring doorbell");
        }
        Ok(true)
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
    async fn test_requeues_only_once_due() {
        let f = fixture(Settings::default());
        let job = f
            .intake
            .submit(spec("v1", Target::Emulator, 6, 2))
            .await
            .unwrap();
        Claimer::new(f.engine.clone(), "w1")
            .try_claim()
            .await
            .unwrap()
            .unwrap();
        Resolver::new(f.engine.clone(), "w1").fail(&job.id).await.unwrap();

        let requeuer = Requeuer::new(f.engine.clone());
        assert_eq!(requeuer.sweep().await.unwrap(), 0);
        f.clock.advance(chrono::Duration::seconds(59));
        assert_eq!(requeuer.sweep().await.unwrap(), 0);
        f.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(requeuer.sweep().await.unwrap(), 1);

        let record = f.intake.status(&job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.retries_done, 1);
        assert_eq!(
            f.store.members(&job.queue).await.unwrap(),
            vec![job.id.to_string()]
        );
        assert_eq!(f.intake.stats().await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_entry_without_record_is_dead_lettered() {
        let f = fixture(Settings::default());
        let keys = f.engine.keys();
        f.store.schedule(&keys.delayed(), "ghost", 0).await.unwrap();

        let requeuer = Requeuer::new(f.engine.clone());
        assert_eq!(requeuer.sweep().await.unwrap(), 0);
        assert_eq!(f.store.scheduled_len(&keys.delayed()).await.unwrap(), 0);
        assert_eq!(
            f.store.members(&keys.dead_letter()).await.unwrap(),
            vec!["ghost"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sweepers_requeue_each_job_once() {
        let f = fixture(Settings::default());
        let mut queues = Vec::new();
        for i in 0..12 {
            let s = f
                .intake
                .submit(spec(&format!("v{i}"), Target::Device, 5, 1))
                .await
                .unwrap();
            queues.push(s.queue);
        }
        let claimer = Claimer::new(f.engine.clone(), "w1");
        while claimer.try_claim().await.unwrap().is_some() {}
        Resolver::new(f.engine.clone(), "w1").fail_all().await.unwrap();
        f.clock.advance(chrono::Duration::seconds(60));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let requeuer = Requeuer::new(f.engine.clone());
                tokio::spawn(async move { requeuer.sweep().await.unwrap() })
            })
            .collect();
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }

        assert_eq!(total, 12);
        assert_eq!(f.store.len(&queues[0]).await.unwrap(), 12);
        assert_eq!(f.intake.stats().await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture(Settings::default());
        let cancel = CancellationToken::new();
        let requeuer = Requeuer::new(f.engine.clone());
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { requeuer.run(&cancel).await })
        };
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
