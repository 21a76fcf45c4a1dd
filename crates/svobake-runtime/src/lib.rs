//! Build coordinator: pipelines partitioning into a bounded worker pool that
//! voxelizes and merges chunks under a shared memory quota.
#![forbid(unsafe_code)]

mod locks;
mod quota;
mod report;
mod settings;

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, unbounded};
use hashbrown::HashMap;
use rayon::{ThreadPool, ThreadPoolBuilder};
use svobake_io::{FormatError, TriError};
use svobake_partition::{PartitionError, TriPartition, partition};
use svobake_svo::ChunkStore;
use svobake_voxel::voxelize_partition;
use svobake_world::{BoundsError, ChunkKey, Placement};

pub use locks::ChunkLocks;
pub use quota::{MemoryQuota, QuotaExceeded, QuotaPermit};
pub use report::{BuildReport, ChunkStatus};
pub use settings::BuildSettings;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source mesh: {0}")]
    Format(#[from] FormatError),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl From<PartitionError> for PipelineError {
    fn from(e: PartitionError) -> Self {
        match e {
            PartitionError::Tri(TriError::Format(f)) => PipelineError::Format(f),
            PartitionError::Tri(TriError::Io(io)) | PartitionError::Io(io) => PipelineError::Io(io),
            PartitionError::Bounds(b) => PipelineError::Bounds(b),
        }
    }
}

/// Shared stop flag. Workers check it before taking each job, so a
/// cancelled run stops between commits.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug)]
pub struct ChunkJob {
    pub part: TriPartition,
    /// Times this job was sent back for lack of a memory permit.
    pub requeues: u32,
}

enum WorkerMsg {
    Done {
        part: TriPartition,
        status: ChunkStatus,
    },
    Requeue(ChunkJob),
}

type ChunkObserver = dyn Fn(ChunkKey, &ChunkStatus) + Send + Sync;

struct WorkerCtx {
    store: ChunkStore,
    quota: MemoryQuota,
    locks: ChunkLocks,
    cancel: CancelToken,
    settings: BuildSettings,
    observer: Option<Arc<ChunkObserver>>,
}

fn process_job(job: ChunkJob, ctx: &WorkerCtx) -> WorkerMsg {
    let key = job.part.key;
    if ctx.cancel.is_cancelled() {
        return WorkerMsg::Done {
            part: job.part,
            status: ChunkStatus::Cancelled,
        };
    }
    let _permit = match ctx.quota.acquire(ctx.settings.quota_timeout) {
        Ok(p) => p,
        Err(e) => {
            log::debug!(target: "runtime", "{key}: {e}, requeueing");
            return WorkerMsg::Requeue(ChunkJob {
                requeues: job.requeues + 1,
                ..job
            });
        }
    };

    let status = match voxelize_partition(&job.part) {
        Err(e) => ChunkStatus::Failed {
            error: format!("partition {} ({}): {e}", job.part.seq, job.part.path.display()),
        },
        Ok(grid) => match ctx.locks.with(key, || ctx.store.merge(key, &grid)) {
            Ok(outcome) => {
                if !ctx.settings.keep_partitions {
                    if let Err(e) = std::fs::remove_file(&job.part.path) {
                        log::warn!(target: "runtime", "could not remove {}: {e}", job.part.path.display());
                    }
                }
                ChunkStatus::Merged {
                    partitions: 1,
                    voxels: outcome.voxel_count,
                }
            }
            Err(e) => ChunkStatus::Failed {
                error: e.to_string(),
            },
        },
    };
    if let ChunkStatus::Failed { error } = &status {
        log::error!(target: "runtime", "{key}: {error}");
    }
    if let Some(observer) = &ctx.observer {
        observer(key, &status);
    }
    WorkerMsg::Done {
        part: job.part,
        status,
    }
}

/// Coordinator-side bookkeeping: every submitted job is outstanding until a
/// worker reports it done. Parts of one chunk are released to the pool one
/// at a time in flush order, so attribute overlay follows source order no
/// matter how workers are scheduled.
struct Dispatch {
    job_tx: Sender<ChunkJob>,
    msg_rx: Receiver<WorkerMsg>,
    outstanding: usize,
    /// Keys with a part in the pool, and their parts still waiting.
    pending: HashMap<ChunkKey, VecDeque<ChunkJob>>,
    report: BuildReport,
}

impl Dispatch {
    fn send(&mut self, job: ChunkJob) {
        if let Err(e) = self.job_tx.send(job) {
            let part = e.into_inner().part;
            self.outstanding -= 1;
            self.report.record(
                part.key,
                ChunkStatus::Failed {
                    error: "worker pool unavailable".into(),
                },
            );
            self.release_next(part.key);
        }
    }

    fn submit(&mut self, job: ChunkJob) {
        self.outstanding += 1;
        let key = job.part.key;
        if let Some(waiting) = self.pending.get_mut(&key) {
            waiting.push_back(job);
            return;
        }
        self.pending.insert(key, VecDeque::new());
        self.send(job);
    }

    /// The previous part of `key` is finished: hand the pool the next one.
    fn release_next(&mut self, key: ChunkKey) {
        let next = match self.pending.get_mut(&key) {
            Some(waiting) => waiting.pop_front(),
            None => None,
        };
        match next {
            Some(job) => self.send(job),
            None => {
                self.pending.remove(&key);
            }
        }
    }

    fn handle(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Requeue(job) => {
                self.report.requeued += 1;
                self.send(job);
            }
            WorkerMsg::Done { part, status } => {
                self.outstanding -= 1;
                self.report.record(part.key, status);
                self.release_next(part.key);
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.msg_rx.try_recv() {
            self.handle(msg);
        }
    }

    fn wait(&mut self) {
        while self.outstanding > 0 {
            match self.msg_rx.recv() {
                Ok(msg) => self.handle(msg),
                Err(_) => break,
            }
        }
    }
}

/// Whether `name` looks like a partition file: `rNNNNN_cNNNNN_NNNN.tri`.
fn is_partition_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".tri") else {
        return false;
    };
    let digits = |s: &str, n: usize| s.len() == n && s.bytes().all(|b| b.is_ascii_digit());
    let mut fields = stem.split('_');
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(r), Some(c), Some(seq), None) => {
            r.strip_prefix('r').is_some_and(|r| digits(r, 5))
                && c.strip_prefix('c').is_some_and(|c| digits(c, 5))
                && digits(seq, 4)
        }
        _ => false,
    }
}

/// Removes partition files an interrupted run left in `scratch`.
fn sweep_scratch(scratch: &Path) -> std::io::Result<usize> {
    let entries = match std::fs::read_dir(scratch) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(is_partition_name) && entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub struct Pipeline {
    settings: BuildSettings,
    cancel: CancelToken,
    observer: Option<Arc<ChunkObserver>>,
}

impl Pipeline {
    pub fn new(settings: BuildSettings) -> Self {
        Self {
            settings,
            cancel: CancelToken::new(),
            observer: None,
        }
    }

    #[inline]
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Handle for stopping the run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Called from worker threads once per processed partition.
    pub fn on_chunk(mut self, f: impl Fn(ChunkKey, &ChunkStatus) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(f));
        self
    }

    fn spawn_workers(&self, ctx: Arc<WorkerCtx>, job_rx: Receiver<ChunkJob>, msg_tx: Sender<WorkerMsg>) -> Result<ThreadPool, PipelineError> {
        let workers = self.settings.worker_count();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("svobake-worker-{i}"))
            .build()?;
        for _ in 0..workers {
            let rx = job_rx.clone();
            let tx = msg_tx.clone();
            let ctx = ctx.clone();
            pool.spawn(move || {
                while let Ok(job) = rx.recv() {
                    if tx.send(process_job(job, &ctx)).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(pool)
    }

    /// Builds every chunk touched by `source` placed at `placement` and
    /// merges it into the store under `output_dir`.
    ///
    /// Errors that make the whole run meaningless (unreadable or malformed
    /// source, geometry outside the world) are returned; per-chunk failures
    /// are recorded in the report and never stop other chunks.
    pub fn run(&self, source: &Path, placement: &Placement) -> Result<BuildReport, PipelineError> {
        let started = Instant::now();
        let settings = &self.settings;
        let store = ChunkStore::open(&settings.output_dir, settings.retry)?;
        let quota = MemoryQuota::for_budget(settings.worker_budget(), settings.chunk_footprint);
        let scratch = settings.scratch_dir();
        let stale = sweep_scratch(&scratch)?;
        if stale > 0 {
            log::warn!(target: "runtime", "removed {stale} stale partitions from {}", scratch.display());
        }
        log::info!(
            target: "runtime",
            "building {} -> {} with {} workers, {} memory permits",
            source.display(),
            settings.output_dir.display(),
            settings.worker_count(),
            quota.permits()
        );

        let ctx = Arc::new(WorkerCtx {
            store,
            quota,
            locks: ChunkLocks::new(),
            cancel: self.cancel.clone(),
            settings: settings.clone(),
            observer: self.observer.clone(),
        });
        let (job_tx, job_rx) = unbounded::<ChunkJob>();
        let (msg_tx, msg_rx) = unbounded::<WorkerMsg>();
        let _pool = self.spawn_workers(ctx, job_rx, msg_tx)?;

        let mut dispatch = Dispatch {
            job_tx,
            msg_rx,
            outstanding: 0,
            pending: HashMap::new(),
            report: BuildReport::default(),
        };
        let cancel = &self.cancel;
        let result = partition(source, placement, &settings.partition_config(&scratch), |part| {
            dispatch.drain();
            if cancel.is_cancelled() {
                dispatch.report.record(part.key, ChunkStatus::Cancelled);
                return ControlFlow::Break(());
            }
            dispatch.submit(ChunkJob { part, requeues: 0 });
            ControlFlow::Continue(())
        });

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                // Let in-flight commits finish; queued jobs see the flag.
                self.cancel.cancel();
                dispatch.wait();
                return Err(e.into());
            }
        };
        dispatch.wait();
        drop(dispatch.job_tx);

        if !settings.keep_partitions {
            // Only succeeds once every partition was merged and removed.
            let _ = std::fs::remove_dir(&scratch);
        }
        let mut report = dispatch.report;
        report.partition = stats;
        report.cancelled = self.cancel.is_cancelled() || stats.stopped;
        report.elapsed = started.elapsed();
        log::info!(
            target: "runtime",
            "build finished in {:.2?}: {} merged, {} failed, {} cancelled",
            report.elapsed,
            report.merged_count(),
            report.failed_count(),
            report.cancelled_count()
        );
        Ok(report)
    }
}
