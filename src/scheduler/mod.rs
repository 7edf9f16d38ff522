//! Scheduler control loop.
//!
//! Each cycle walks the configured endpoints in order, works out how many
//! jobs each may still take, pulls candidates from the task queue and
//! queues admitted (job, endpoint) pairs to the endpoint's submit pool.
//! Submissions themselves run on the pool's workers; the loop never waits
//! for one.

pub mod matcher;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::director::{Director, SubmissionRequest};
use crate::endpoint::{Endpoint, EndpointRegistry, Vocabulary};
use crate::external::{ReplicaCatalog, TaskQueue};
use crate::ledger::{JobId, JobLedger};

pub use matcher::{CandidateJob, MatchOutcome, Matcher, RejectReason, Selector};
pub use pool::{DispatchError, PoolStats, SubmitPool};

/// What one scheduler cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub endpoints: usize,
    /// Endpoints skipped because they had no free slots.
    pub full: usize,
    pub pulled: usize,
    pub dispatched: usize,
    pub rejected: usize,
    /// Jobs handed back to the task queue at the end of the cycle.
    pub released: usize,
    /// Endpoints whose submit pool was saturated this cycle.
    pub disabled: Vec<String>,
}

enum Offer {
    Dispatched,
    Rejected(CandidateJob),
    Saturated(CandidateJob),
}

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<EndpointRegistry>,
    ledger: Arc<dyn JobLedger>,
    task_queue: Arc<dyn TaskQueue>,
    matcher: Matcher,
    pools: HashMap<String, SubmitPool>,
}

impl Scheduler {
    /// Build the scheduler and start one submit pool per configured pool.
    ///
    /// `cancel` stops the pool workers from taking new submissions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        vocabulary: Vocabulary,
        registry: Arc<EndpointRegistry>,
        ledger: Arc<dyn JobLedger>,
        task_queue: Arc<dyn TaskQueue>,
        catalog: Arc<dyn ReplicaCatalog>,
        director: Arc<Director>,
        cancel: CancellationToken,
    ) -> Self {
        let pools = config
            .submit_pools
            .iter()
            .map(|name| {
                let pool_config = config.pools.get(name).cloned().unwrap_or_default();
                let pool = SubmitPool::spawn(
                    name.clone(),
                    pool_config.workers,
                    pool_config.queue_depth,
                    director.clone(),
                    cancel.clone(),
                );
                (name.clone(), pool)
            })
            .collect();

        Self {
            config,
            registry,
            ledger,
            task_queue,
            matcher: Matcher::new(vocabulary, catalog),
            pools,
        }
    }

    /// Run cycles on the polling interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.polling_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// Run a single scheduling cycle.
    pub async fn run_once(&self) -> CycleReport {
        let snapshot = match self.registry.reload(&self.config.running_endpoints()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Could not reload endpoints, keeping previous set");
                self.registry.snapshot()
            }
        };

        let mut report = CycleReport::default();
        let mut pending: Vec<CandidateJob> = Vec::new();

        for endpoint in snapshot.iter() {
            report.endpoints += 1;

            let occupied = match self.ledger.occupied_slots(&endpoint.name_node) {
                Ok(occupied) => occupied,
                Err(e) => {
                    tracing::error!(endpoint = %endpoint.name, error = %e, "Could not count endpoint jobs, skipping");
                    continue;
                }
            };
            let mut free = i64::from(endpoint.capacity) - occupied as i64;
            if free <= 0 {
                tracing::info!(
                    endpoint = %endpoint.name,
                    occupied,
                    capacity = endpoint.capacity,
                    "Endpoint at its job limit, skipping"
                );
                report.full += 1;
                continue;
            }

            let Some(pool) = self.pools.get(&endpoint.pool) else {
                tracing::error!(endpoint = %endpoint.name, pool = %endpoint.pool, "Endpoint belongs to no running submit pool, skipping");
                continue;
            };

            let mut saturated = false;

            // Jobs left over from earlier endpoints get the first chance.
            let mut still_pending = Vec::with_capacity(pending.len());
            for candidate in pending.drain(..) {
                if saturated || free <= 0 {
                    still_pending.push(candidate);
                    continue;
                }
                match self.offer(pool, endpoint, candidate, free).await {
                    Offer::Dispatched => {
                        free -= 1;
                        report.dispatched += 1;
                    }
                    Offer::Rejected(candidate) => still_pending.push(candidate),
                    Offer::Saturated(candidate) => {
                        saturated = true;
                        still_pending.push(candidate);
                    }
                }
            }
            pending = still_pending;

            if !saturated && free > 0 {
                let queues = match self.task_queue.matching_queues(&endpoint.requirements).await {
                    Ok(queues) => queues,
                    Err(e) => {
                        tracing::error!(endpoint = %endpoint.name, error = %e, "Could not retrieve matching task queues");
                        Vec::new()
                    }
                };
                tracing::debug!(endpoint = %endpoint.name, queues = queues.len(), free, "Matching task queues");

                'queues: for queue in &queues {
                    let mut taken = 0u32;
                    while taken < queue.jobs && free > 0 {
                        let job_id = match self.task_queue.take_one_job(queue).await {
                            Ok(Some(job_id)) => job_id,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(queue = queue.id, error = %e, "Could not take job from task queue");
                                break;
                            }
                        };
                        taken += 1;
                        report.pulled += 1;

                        let candidate = match CandidateJob::fetch(self.task_queue.as_ref(), job_id).await {
                            Ok(candidate) => candidate,
                            Err(e) => {
                                tracing::error!(job_id, error = %e, "Could not read job description");
                                self.release(job_id).await;
                                report.released += 1;
                                continue;
                            }
                        };

                        match self.offer(pool, endpoint, candidate, free).await {
                            Offer::Dispatched => {
                                free -= 1;
                                report.dispatched += 1;
                            }
                            Offer::Rejected(candidate) => {
                                report.rejected += 1;
                                pending.push(candidate);
                            }
                            Offer::Saturated(candidate) => {
                                saturated = true;
                                pending.push(candidate);
                                break 'queues;
                            }
                        }
                    }
                }
            }

            if saturated {
                tracing::warn!(endpoint = %endpoint.name, pool = %pool.name(), "Submit pool full, endpoint disabled until next cycle");
                report.disabled.push(endpoint.name.clone());
            }
        }

        for candidate in pending {
            tracing::info!(job_id = candidate.job_id, "No endpoint matched job this cycle");
            self.release(candidate.job_id).await;
            report.released += 1;
        }

        tracing::info!(
            endpoints = report.endpoints,
            full = report.full,
            pulled = report.pulled,
            dispatched = report.dispatched,
            rejected = report.rejected,
            released = report.released,
            disabled = ?report.disabled,
            "Scheduler cycle finished"
        );
        report
    }

    async fn offer(
        &self,
        pool: &SubmitPool,
        endpoint: &Endpoint,
        candidate: CandidateJob,
        free: i64,
    ) -> Offer {
        if let MatchOutcome::Reject(_) = self.matcher.check(&candidate, endpoint).await {
            return Offer::Rejected(candidate);
        }

        let request = SubmissionRequest::new(
            candidate.job_id,
            endpoint,
            free,
            candidate.dataset(),
            candidate.attributes.clone(),
        );
        let task_id = request.task_id;
        match pool.try_dispatch(request) {
            Ok(()) => {
                tracing::info!(
                    job_id = candidate.job_id,
                    endpoint = %endpoint.name,
                    pool = %pool.name(),
                    %task_id,
                    "Job queued for submission"
                );
                let delay = self.config.thread_start_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Offer::Dispatched
            }
            Err(DispatchError::Saturated(_)) => Offer::Saturated(candidate),
            Err(DispatchError::Closed(_)) => {
                tracing::error!(pool = %pool.name(), "Submit pool is shut down");
                Offer::Saturated(candidate)
            }
        }
    }

    async fn release(&self, job_id: JobId) {
        if let Err(e) = self.task_queue.release_job(job_id).await {
            tracing::warn!(job_id, error = %e, "Could not hand job back to the task queue");
        }
    }

    pub fn pool_stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<(String, PoolStats)> = self
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Stop the submit pools, letting queued submissions finish.
    pub async fn shutdown(self) {
        for (_, pool) in self.pools {
            pool.shutdown().await;
        }
    }
}
