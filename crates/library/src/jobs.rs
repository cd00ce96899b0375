use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::TrackId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::LibraryError;

pub const ENRICH_TRACK: &str = "enrich_track";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Low,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    IngestFile { path: PathBuf },
    RemoveFile { path: PathBuf },
    MoveFile { from: PathBuf, to: PathBuf },
    DeleteTrack { id: TrackId },
    TrackAdded { id: TrackId },
    EnrichTrack { id: TrackId },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::IngestFile { .. } => "ingest_file",
            Job::RemoveFile { .. } => "remove_file",
            Job::MoveFile { .. } => "move_file",
            Job::DeleteTrack { .. } => "delete_track",
            Job::TrackAdded { .. } => "track_added",
            Job::EnrichTrack { .. } => ENRICH_TRACK,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Job::EnrichTrack { .. } => Priority::Low,
            _ => Priority::High,
        }
    }

    pub fn track_id(&self) -> Option<TrackId> {
        match self {
            Job::DeleteTrack { id } | Job::TrackAdded { id } | Job::EnrichTrack { id } => Some(*id),
            _ => None,
        }
    }

    /// Maps the job name recorded on an errored track back to its retry job.
    pub fn retry_for(job_name: &str, id: TrackId) -> Option<Job> {
        match job_name {
            ENRICH_TRACK => Some(Job::EnrichTrack { id }),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub high: usize,
    pub low: usize,
}

#[derive(Default)]
struct DepthCounters {
    high: AtomicUsize,
    low: AtomicUsize,
}

impl DepthCounters {
    fn counter(&self, priority: Priority) -> &AtomicUsize {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }
}

/// Fire-and-forget producer side of the two priority queues.
#[derive(Clone)]
pub struct JobQueue {
    high: mpsc::UnboundedSender<Job>,
    low: mpsc::UnboundedSender<Job>,
    depths: Arc<DepthCounters>,
}

pub struct JobReceivers {
    high: mpsc::UnboundedReceiver<Job>,
    low: mpsc::UnboundedReceiver<Job>,
    depths: Arc<DepthCounters>,
}

impl JobReceivers {
    /// Pulls one job without waiting, high queue first.
    pub fn try_next(&mut self) -> Option<Job> {
        let job = self.high.try_recv().or_else(|_| self.low.try_recv()).ok()?;
        self.depths.counter(job.priority()).fetch_sub(1, Ordering::Relaxed);
        Some(job)
    }
}

impl JobQueue {
    pub fn new() -> (Self, JobReceivers) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let depths = Arc::new(DepthCounters::default());
        let queue = Self {
            high: high_tx,
            low: low_tx,
            depths: Arc::clone(&depths),
        };
        let receivers = JobReceivers {
            high: high_rx,
            low: low_rx,
            depths,
        };
        (queue, receivers)
    }

    pub fn enqueue(&self, job: Job) -> bool {
        let priority = job.priority();
        let sender = match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        };
        debug!("Enqueue {} ({:?})", job.name(), priority);
        self.depths.counter(priority).fetch_add(1, Ordering::Relaxed);
        if sender.send(job).is_err() {
            self.depths.counter(priority).fetch_sub(1, Ordering::Relaxed);
            warn!("Job queue closed; dropping {:?} job", priority);
            return false;
        }
        true
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            high: self.depths.high.load(Ordering::Relaxed),
            low: self.depths.low.load(Ordering::Relaxed),
        }
    }
}

pub trait JobHandler: Send + Sync + 'static {
    /// Runs once per worker before it pulls any job.
    fn bootstrap(&self, worker: usize) -> impl Future<Output = ()> + Send {
        debug!("Worker {} ready", worker);
        async {}
    }

    fn run(&self, job: Job) -> impl Future<Output = Result<(), LibraryError>> + Send;

    fn on_timeout(&self, job: Job, limit: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    pub workers: usize,
    pub job_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            job_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct PoolCounters {
    busy: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn start<H: JobHandler>(receivers: JobReceivers, handler: Arc<H>, options: PoolOptions) -> Self {
        let JobReceivers { high, low, depths } = receivers;
        let high = Arc::new(Mutex::new(high));
        let low = Arc::new(Mutex::new(low));
        let cancel = CancellationToken::new();
        let counters = Arc::new(PoolCounters::default());
        let workers = options.workers.max(1);

        let handles = (0..workers)
            .map(|index| {
                let worker = Worker {
                    index,
                    handler: Arc::clone(&handler),
                    high: Arc::clone(&high),
                    low: Arc::clone(&low),
                    depths: Arc::clone(&depths),
                    counters: Arc::clone(&counters),
                    cancel: cancel.clone(),
                    timeout: options.job_timeout,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!("Started {} pipeline workers", workers);
        Self {
            cancel,
            handles,
            counters,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.handles.len(),
            busy: self.counters.busy.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Stops pulling new jobs, lets in-flight ones finish within `grace`,
    /// then aborts whatever is left.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for mut handle in self.handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Worker did not stop within {:?}; aborting", grace);
                handle.abort();
            }
        }
    }
}

struct Worker<H> {
    index: usize,
    handler: Arc<H>,
    high: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    low: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    depths: Arc<DepthCounters>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl<H: JobHandler> Worker<H> {
    async fn run(self) {
        self.handler.bootstrap(self.index).await;
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(job) = next_job(&self.high) => job,
                Some(job) = next_job(&self.low) => job,
                else => break,
            };
            self.depths.counter(job.priority()).fetch_sub(1, Ordering::Relaxed);
            self.execute(job).await;
        }
        debug!("Worker {} stopped", self.index);
    }

    async fn execute(&self, job: Job) {
        let name = job.name();
        self.counters.busy.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.timeout, self.handler.run(job.clone())).await {
            Ok(Ok(())) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!("Worker {} finished {}", self.index, name);
            }
            Ok(Err(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Job {} failed: {}", name, err);
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!("Job {} timed out after {:?}", name, self.timeout);
                self.handler.on_timeout(job, self.timeout).await;
            }
        }
        self.counters.busy.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn next_job(receiver: &Mutex<mpsc::UnboundedReceiver<Job>>) -> Option<Job> {
    receiver.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct Recorder {
        seen: SyncMutex<Vec<Job>>,
        timeouts: SyncMutex<Vec<Job>>,
        booted: AtomicUsize,
    }

    impl JobHandler for Recorder {
        fn bootstrap(&self, _worker: usize) -> impl Future<Output = ()> + Send {
            self.booted.fetch_add(1, Ordering::SeqCst);
            async {}
        }

        fn run(&self, job: Job) -> impl Future<Output = Result<(), LibraryError>> + Send {
            self.seen.lock().push(job.clone());
            async move {
                match job {
                    Job::EnrichTrack { id: 99 } => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }
                    Job::DeleteTrack { id: 0 } => Err(LibraryError::TrackNotFound(0)),
                    _ => Ok(()),
                }
            }
        }

        fn on_timeout(&self, job: Job, _limit: Duration) -> impl Future<Output = ()> + Send {
            self.timeouts.lock().push(job);
            async {}
        }
    }

    #[test]
    fn jobs_route_by_priority() {
        assert_eq!(Job::EnrichTrack { id: 1 }.priority(), Priority::Low);
        assert_eq!(Job::TrackAdded { id: 1 }.priority(), Priority::High);
        assert_eq!(Job::RemoveFile { path: PathBuf::from("/a") }.priority(), Priority::High);
        assert_eq!(Job::retry_for("enrich_track", 4), Some(Job::EnrichTrack { id: 4 }));
        assert_eq!(Job::retry_for("unknown", 4), None);
        let json = serde_json::to_value(Job::DeleteTrack { id: 3 }).unwrap();
        assert_eq!(json["job"], "delete_track");
    }

    #[test]
    fn depths_track_pending_jobs() {
        let (queue, mut receivers) = JobQueue::new();
        queue.enqueue(Job::EnrichTrack { id: 1 });
        queue.enqueue(Job::TrackAdded { id: 1 });
        queue.enqueue(Job::EnrichTrack { id: 2 });
        assert_eq!(queue.depths(), QueueDepths { high: 1, low: 2 });

        assert_eq!(receivers.try_next(), Some(Job::TrackAdded { id: 1 }));
        assert_eq!(receivers.try_next(), Some(Job::EnrichTrack { id: 1 }));
        assert_eq!(queue.depths(), QueueDepths { high: 0, low: 1 });
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_counts_outcomes() {
        let (queue, receivers) = JobQueue::new();
        let handler = Arc::new(Recorder::default());
        let pool = WorkerPool::start(
            receivers,
            Arc::clone(&handler),
            PoolOptions {
                workers: 2,
                job_timeout: Duration::from_millis(50),
            },
        );

        queue.enqueue(Job::TrackAdded { id: 1 });
        queue.enqueue(Job::DeleteTrack { id: 0 });
        queue.enqueue(Job::EnrichTrack { id: 99 });

        for _ in 0..100 {
            let stats = pool.stats();
            if stats.completed + stats.failed + stats.timed_out == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!((stats.completed, stats.failed, stats.timed_out), (1, 1, 1));
        assert_eq!(handler.booted.load(Ordering::SeqCst), 2);
        assert_eq!(handler.timeouts.lock().as_slice(), &[Job::EnrichTrack { id: 99 }]);
        assert_eq!(queue.depths(), QueueDepths::default());

        pool.shutdown(Duration::from_secs(1)).await;
    }
}
