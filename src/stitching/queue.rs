//! Single-worker stitching queue.
//!
//! Jobs are composed strictly in submission order by one background task, so
//! at most one large image is being assembled at any time. Every submission
//! returns a [`StitchHandle`] that resolves with that job's result; a failing
//! or panicking job resolves only its own handle.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::compositor::Compositor;
use super::job::StitchJob;
use crate::error::{ScopeError, ScopeResult};

/// Result of one completed stitch job.
#[derive(Debug, Clone)]
pub struct StitchOutcome {
    /// Job id
    pub job_id: Uuid,
    /// Target name
    pub target: String,
    /// Files written, one per angle
    pub outputs: Vec<PathBuf>,
    /// When the worker picked the job up
    pub started_at: DateTime<Utc>,
    /// When the last angle finished
    pub finished_at: DateTime<Utc>,
}

/// Completion signal for one submitted job.
#[derive(Debug)]
pub struct StitchHandle {
    job_id: Uuid,
    target: String,
    rx: oneshot::Receiver<ScopeResult<StitchOutcome>>,
}

impl StitchHandle {
    /// Job id.
    #[must_use]
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Target name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> ScopeResult<StitchOutcome> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ScopeError::Stitching(format!(
                "Stitching worker stopped before '{}' was composed",
                self.target
            ))),
        }
    }
}

struct Queued {
    job: StitchJob,
    done: oneshot::Sender<ScopeResult<StitchOutcome>>,
}

/// Handle to the stitching worker.
pub struct StitchingQueue {
    tx: Option<mpsc::UnboundedSender<Queued>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl StitchingQueue {
    /// Spawn the worker on the current tokio runtime.
    #[must_use]
    pub fn new(compositor: Arc<dyn Compositor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(rx, compositor, pending.clone()));
        Self {
            tx: Some(tx),
            worker: Some(worker),
            pending,
        }
    }

    /// Jobs submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Hand a job to the worker. Ownership moves to the queue.
    pub fn submit(&self, job: StitchJob) -> ScopeResult<StitchHandle> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ScopeError::Stitching("Stitching queue is shut down".into()))?;
        let (done, rx) = oneshot::channel();
        let handle = StitchHandle {
            job_id: job.id,
            target: job.target.clone(),
            rx,
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(Queued { job, done }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ScopeError::Stitching("Stitching worker has exited".into()));
        }
        info!(target_name = handle.target(), job_id = %handle.job_id, "Stitch job queued");
        Ok(handle)
    }

    /// Stop accepting jobs and wait for the queued ones to drain.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Stitching worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for StitchingQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued jobs and exit
        self.tx.take();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    compositor: Arc<dyn Compositor>,
    pending: Arc<AtomicUsize>,
) {
    debug!("Stitching worker started");
    while let Some(Queued { job, done }) = rx.recv().await {
        let span = info_span!("stitch", target_name = %job.target, job_id = %job.id);
        let target = job.target.clone();
        let result = AssertUnwindSafe(compose_job(compositor.as_ref(), job))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ScopeError::Stitching(format!(
                    "Stitching '{target}' panicked: {message}"
                )))
            });

        match &result {
            Ok(outcome) => info!(
                target_name = %target,
                outputs = outcome.outputs.len(),
                "Stitch job finished"
            ),
            Err(e) => error!(target_name = %target, "Stitch job failed: {}", e),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
        if done.send(result).is_err() {
            debug!("Nobody is waiting on the stitch result for '{}'", target);
        }
    }
    debug!("Stitching worker stopped");
}

async fn compose_job(compositor: &dyn Compositor, job: StitchJob) -> ScopeResult<StitchOutcome> {
    let started_at = Utc::now();
    let requests = job.composition_requests()?;
    let total = requests.len();

    let mut outputs = Vec::with_capacity(total);
    let mut failures = Vec::new();
    // Angles one after another; each request carries only its own tiles
    for request in &requests {
        match compositor.compose(request).await {
            Ok(path) => outputs.push(path),
            Err(e) => {
                warn!(angle = ?request.angle, "Composition failed: {}", e);
                failures.push(e.to_string());
            }
        }
    }

    if !failures.is_empty() {
        return Err(ScopeError::Stitching(format!(
            "{} of {} angle(s) failed for '{}': {}",
            failures.len(),
            total,
            job.target,
            failures.join("; ")
        )));
    }

    Ok(StitchOutcome {
        job_id: job.id,
        target: job.target,
        outputs,
        started_at,
        finished_at: Utc::now(),
    })
}
