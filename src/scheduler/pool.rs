use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::director::{Director, DirectorError, SubmissionRequest};

/// Why a submission could not be queued. The request is handed back.
#[derive(Debug)]
pub enum DispatchError {
    /// Every queue slot is taken.
    Saturated(Box<SubmissionRequest>),
    /// The workers have stopped.
    Closed(Box<SubmissionRequest>),
}

impl DispatchError {
    pub fn into_request(self) -> SubmissionRequest {
        match self {
            DispatchError::Saturated(request) | DispatchError::Closed(request) => *request,
        }
    }
}

/// Outcome counters kept by the completion callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: u64,
    pub submitted: u64,
    pub failed: u64,
}

/// Bounded pool of submit workers for one submit pool.
///
/// The control loop queues requests with [`SubmitPool::try_dispatch`], which
/// never waits: once `queue_depth` requests are pending it reports
/// [`DispatchError::Saturated`]. Workers run each submission to completion;
/// cancellation only stops them from taking new requests.
pub struct SubmitPool {
    name: String,
    tx: mpsc::Sender<SubmissionRequest>,
    stats: Arc<Mutex<PoolStats>>,
    workers: Vec<JoinHandle<()>>,
}

impl SubmitPool {
    pub fn spawn(
        name: impl Into<String>,
        workers: usize,
        queue_depth: usize,
        director: Arc<Director>,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        let worker_count = workers.max(1);
        let workers = (0..worker_count)
            .map(|worker| {
                let rx = rx.clone();
                let director = director.clone();
                let stats = stats.clone();
                let cancel = cancel.clone();
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => None,
                            request = async { rx.lock().await.recv().await } => request,
                        };
                        let Some(request) = next else {
                            break;
                        };
                        let result = director.submit(&request).await;
                        on_complete(&pool, &stats, &request, &result);
                    }
                    tracing::debug!(pool = %pool, worker, "Submit worker stopped");
                })
            })
            .collect();

        tracing::info!(pool = %name, workers = worker_count, queue_depth, "Submit pool started");

        Self {
            name,
            tx,
            stats,
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a submission without waiting for room.
    pub fn try_dispatch(&self, request: SubmissionRequest) -> Result<(), DispatchError> {
        match self.tx.try_send(request) {
            Ok(()) => {
                self.stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .queued += 1;
                Ok(())
            }
            Err(TrySendError::Full(request)) => Err(DispatchError::Saturated(Box::new(request))),
            Err(TrySendError::Closed(request)) => Err(DispatchError::Closed(Box::new(request))),
        }
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting requests and wait for the workers to finish what is
    /// already queued.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(pool = %self.name, error = %e, "Submit worker panicked");
            }
        }
    }
}

/// Completion callback. Only logs and counts; failed submissions stay
/// visible through the ledger's error message and are not re-queued.
fn on_complete(
    pool: &str,
    stats: &Mutex<PoolStats>,
    request: &SubmissionRequest,
    result: &Result<String, DirectorError>,
) {
    let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
    match result {
        Ok(backend_id) => {
            stats.submitted += 1;
            tracing::info!(
                pool,
                task_id = %request.task_id,
                job_id = request.job_id,
                endpoint = %request.endpoint.name,
                backend_id = %backend_id,
                "Submission finished"
            );
        }
        Err(e) => {
            stats.failed += 1;
            tracing::error!(
                pool,
                task_id = %request.task_id,
                job_id = request.job_id,
                endpoint = %request.endpoint.name,
                error = %e,
                "Submission failed"
            );
        }
    }
}
