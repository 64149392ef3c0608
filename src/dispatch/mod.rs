//! Worker dispatcher: submits chunks to a backend, tracks job states, retries failed attempts
//! and gathers per-window results.

pub mod job;
pub mod backend;
pub mod local;
pub mod worker;
pub mod checkpoint;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use crate::{
    Error,
    err::validate_param,
    ext::{
        self,
        rand::XoshiroRng,
        ser::{json_get, JsonSer},
    },
    pipeline::status::RunStatus,
    plan::Chunk,
};
pub use job::{Job, JobState, ChunkResult};
pub use backend::{Backend, Handle, TaskSpec, TaskState, Resources, MemClass};
pub use local::LocalBackend;
pub use worker::{Worker, WorkerContext, AlgoConfig, Software, GenomeBuild, CommandWorker};
pub use checkpoint::Checkpoint;

/// Shared cancellation flag. Once set, cannot be unset.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Dispatcher parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchParams {
    /// Maximal number of simultaneously submitted jobs (per chromosome).
    pub max_in_flight: usize,
    /// Number of resubmissions after the first attempt.
    pub max_retries: u32,
    /// Wall-clock limit of a single attempt, measured from the moment the task starts running.
    /// Time spent in the backend queue does not count.
    pub timeout: Option<Duration>,
    /// After a fatal failure, cancel all other jobs of the same chromosome.
    pub fail_fast: bool,
    pub poll_interval: Duration,
    /// Resubmission delay is random in `[0, min(backoff_max, backoff_base * 2^(attempt - 1))]`.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// CPUs, requested for each task.
    pub cpus: u16,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            max_retries: 3,
            timeout: None,
            fail_fast: true,
            poll_interval: Duration::from_millis(50),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            cpus: 1,
        }
    }
}

impl DispatchParams {
    pub fn validate(&self) -> Result<(), Error> {
        validate_param!(self.max_in_flight > 0, "Maximal number of jobs in flight must be positive");
        validate_param!(self.cpus > 0, "Number of CPUs per task must be positive");
        validate_param!(!self.poll_interval.is_zero(), "Poll interval must be positive");
        if let Some(timeout) = self.timeout {
            validate_param!(!timeout.is_zero(), "Job timeout must be positive");
        }
        validate_param!(self.backoff_base <= self.backoff_max,
            "Base backoff ({}) cannot exceed maximal backoff ({})",
            ext::fmt::Duration(self.backoff_base), ext::fmt::Duration(self.backoff_max));
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Durations are stored in milliseconds.
impl JsonSer for DispatchParams {
    fn save(&self) -> json::JsonValue {
        json::object!{
            max_in_flight: self.max_in_flight,
            max_retries: self.max_retries,
            timeout_ms: self.timeout.map(millis),
            fail_fast: self.fail_fast,
            poll_interval_ms: millis(self.poll_interval),
            backoff_base_ms: millis(self.backoff_base),
            backoff_max_ms: millis(self.backoff_max),
            cpus: self.cpus,
        }
    }

    fn load(obj: &json::JsonValue) -> Result<Self, Error> {
        json_get!(obj -> max_in_flight (as_usize), max_retries (as_u32), fail_fast (as_bool),
            poll_interval_ms (as_u64), backoff_base_ms (as_u64), backoff_max_ms (as_u64), cpus (as_u16));
        Ok(Self {
            max_in_flight, max_retries, fail_fast, cpus,
            timeout: obj["timeout_ms"].as_u64().map(Duration::from_millis),
            poll_interval: Duration::from_millis(poll_interval_ms),
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
        })
    }
}

/// Dispatches jobs of one chromosome at a time.
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    params: DispatchParams,
    algo: Arc<AlgoConfig>,
    work_dir: PathBuf,
    checkpoint: Option<Checkpoint>,
    cancel: CancelToken,
    status: Option<Arc<RunStatus>>,
    rng: XoshiroRng,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, params: DispatchParams, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend, params,
            algo: Arc::new(AlgoConfig::default()),
            work_dir: work_dir.into(),
            checkpoint: None,
            cancel: CancelToken::new(),
            status: None,
            rng: ext::rand::init_rng(None),
        }
    }

    pub fn set_algo(mut self, algo: Arc<AlgoConfig>) -> Self {
        self.algo = algo;
        self
    }

    pub fn set_checkpoint(mut self, checkpoint: Option<Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn set_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_status(mut self, status: Arc<RunStatus>) -> Self {
        self.status = Some(status);
        self
    }

    /// Seed for the retry backoff.
    pub fn set_seed(mut self, seed: Option<u64>) -> Self {
        self.rng = ext::rand::init_rng(seed);
        self
    }

    pub fn params(&self) -> &DispatchParams {
        &self.params
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Attempt-scoped working directory.
    pub fn attempt_dir(&self, job: &Job, attempt: u32) -> PathBuf {
        let window = job.window();
        chrom_dir(&self.work_dir, window.chrom()).join(format!("window_{:04}", window.index()))
            .join(format!("attempt_{}", attempt))
    }

    /// Starts a new attempt of the job.
    pub fn submit(&self, job: &mut Job) -> Result<Handle, Error> {
        let attempt = job.next_attempt();
        let task = TaskSpec {
            name: format!("{}.a{}", job.window().key(), attempt),
            chunk: Arc::clone(job.chunk()),
            attempt,
            work_dir: self.attempt_dir(job, attempt),
            resources: Resources::estimate(job.chunk(), self.params.cpus),
            algo: Arc::clone(&self.algo),
        };
        log::debug!("    Submitting {} to {} backend ({})", task.name, self.backend.name(), task.resources);
        let handle = self.backend.submit(task)?;
        job.start_attempt(handle)?;
        Ok(handle)
    }

    /// Creates jobs for all chunks and waits for them to finish.
    pub fn run(&mut self, chrom: &str, chunks: Vec<Chunk>)
        -> Result<BTreeMap<usize, Result<Arc<ChunkResult>, Error>>, Error>
    {
        let jobs = chunks.into_iter().map(Job::new).collect();
        self.await_all(chrom, jobs)
    }

    /// Runs all jobs until each of them reaches a terminal state.
    /// Returns successful results or fatal errors, keyed by the window index.
    /// Outer error is returned only if the dispatcher itself misbehaves.
    pub fn await_all(&mut self, chrom: &str, mut jobs: Vec<Job>)
        -> Result<BTreeMap<usize, Result<Arc<ChunkResult>, Error>>, Error>
    {
        let timer = Instant::now();
        jobs.sort_by_key(Job::index);
        self.restore(&mut jobs)?;
        self.report(chrom, &jobs);

        let mut fatal: Option<usize> = None;
        loop {
            if self.cancel.is_cancelled() {
                log::warn!("{}: run cancelled, aborting remaining jobs", chrom);
                self.abort_all(&mut jobs)?;
            } else if let (Some(index), true) = (fatal, self.params.fail_fast) {
                if jobs.iter().any(|job| !job.state().is_terminal()) {
                    log::error!("{}: window {} failed fatally, aborting remaining jobs", chrom, index);
                    self.abort_all(&mut jobs)?;
                }
            }

            for job in jobs.iter_mut() {
                if job.state().is_active() {
                    self.check_job(job)?;
                    if let JobState::FatallyFailed(_) = job.state() {
                        fatal.get_or_insert(job.index());
                    }
                }
            }

            if !self.cancel.is_cancelled() && !(fatal.is_some() && self.params.fail_fast) {
                let now = Instant::now();
                let mut in_flight = jobs.iter().filter(|job| job.state().is_active()).count();
                for job in jobs.iter_mut() {
                    if in_flight >= self.params.max_in_flight {
                        break;
                    }
                    if !job.is_ready(now) {
                        continue;
                    }
                    match self.submit(job) {
                        Ok(_) => in_flight += 1,
                        Err(e) => {
                            self.fail_attempt(job, JobState::Failed(format!("submission failed: {}", e)))?;
                            if let JobState::FatallyFailed(_) = job.state() {
                                fatal.get_or_insert(job.index());
                            }
                        }
                    }
                }
            }

            self.report(chrom, &jobs);
            if jobs.iter().all(|job| job.state().is_terminal()) {
                break;
            }
            std::thread::sleep(self.params.poll_interval);
        }

        let n_succeeded = jobs.iter().filter(|job| job.state() == &JobState::Succeeded).count();
        let n_retries: u32 = jobs.iter().map(Job::retries).sum();
        log::info!("{}: {} / {} jobs succeeded ({} retries) in {}", chrom, n_succeeded, jobs.len(),
            n_retries, ext::fmt::Duration(timer.elapsed()));
        Ok(jobs.into_iter().map(|job| (job.index(), Self::outcome(chrom, job))).collect())
    }

    /// Marks empty chunks and checkpointed windows as succeeded.
    fn restore(&self, jobs: &mut [Job]) -> Result<(), Error> {
        let mut n_restored = 0;
        for job in jobs.iter_mut() {
            if job.chunk().is_empty() {
                job.succeed(ChunkResult::empty(job.window().clone()))?;
            } else if let Some(result) = self.checkpoint.as_ref().and_then(|ch| ch.restore(job.chunk())) {
                job.restore(result)?;
                n_restored += 1;
            }
        }
        if n_restored > 0 {
            log::info!("    Restored {} / {} windows from checkpoints", n_restored, jobs.len());
        }
        Ok(())
    }

    /// Polls the backend and updates the job accordingly.
    fn check_job(&mut self, job: &mut Job) -> Result<(), Error> {
        let Some(handle) = job.handle() else {
            return Err(Error::RuntimeError(format!("{} is {} but has no task handle", job.window(), job.state())));
        };
        let state = match self.backend.poll(handle) {
            Ok(state) => state,
            Err(e) => TaskState::Failed(format!("could not poll task {}: {}", handle, e)),
        };
        match state {
            TaskState::Queued => {}
            TaskState::Running => {
                if job.state() == &JobState::Submitted {
                    job.transition(JobState::Running)?;
                }
            }
            TaskState::Succeeded => {
                match self.backend.fetch_output(handle) {
                    Ok(records) => {
                        let result = ChunkResult::new(job.window().clone(), job.attempt(), records);
                        self.backend.release(handle);
                        if job.succeed(result)? {
                            self.store(job);
                        }
                    }
                    Err(e) => self.fail_attempt(job, JobState::Failed(format!("could not fetch output: {}", e)))?,
                }
                return Ok(());
            }
            TaskState::Failed(reason) => return self.fail_attempt(job, JobState::Failed(reason)),
            TaskState::Preempted => return self.fail_attempt(job, JobState::Preempted),
            TaskState::Cancelled => return self.fail_attempt(job,
                JobState::Failed("task was cancelled by the backend".to_owned())),
        }

        if let (Some(timeout), Some(elapsed)) = (self.params.timeout, job.elapsed()) {
            if elapsed >= timeout {
                if let Err(e) = self.backend.cancel(handle) {
                    log::warn!("Could not cancel task {}: {}", handle, e.display());
                }
                return self.fail_attempt(job, JobState::Failed(format!("timed out after {}",
                    ext::fmt::Duration(elapsed))));
            }
        }
        Ok(())
    }

    /// Records failed attempt, and either schedules a retry or marks the job as fatally failed.
    fn fail_attempt(&mut self, job: &mut Job, failure: JobState) -> Result<(), Error> {
        if let Some(handle) = job.take_handle() {
            self.backend.release(handle);
        }
        job.transition(failure)?;
        let reason = job.last_error().unwrap_or("unknown reason").to_owned();
        if job.attempt() <= self.params.max_retries {
            let delay = ext::rand::backoff_delay(&mut self.rng, self.params.backoff_base, self.params.backoff_max,
                job.attempt());
            log::warn!("{}: attempt {} failed ({}), retrying in {}", job.window(), job.attempt(), reason,
                ext::fmt::Duration(delay));
            job.transition(JobState::Pending)?;
            job.delay_until(Instant::now() + delay);
        } else {
            log::error!("{}: attempt {} failed ({}), no retries left", job.window(), job.attempt(), reason);
            job.transition(JobState::FatallyFailed(reason))?;
        }
        Ok(())
    }

    /// Cancels all unfinished jobs.
    fn abort_all(&self, jobs: &mut [Job]) -> Result<(), Error> {
        for job in jobs.iter_mut() {
            if let Some(handle) = job.take_handle() {
                if let Err(e) = self.backend.cancel(handle) {
                    log::warn!("Could not cancel task {}: {}", handle, e.display());
                }
                self.backend.release(handle);
            }
            if !job.state().is_terminal() {
                job.transition(JobState::Cancelled)?;
            }
        }
        Ok(())
    }

    fn store(&self, job: &Job) {
        if let (Some(checkpoint), Some(result)) = (&self.checkpoint, job.result()) {
            if let Err(e) = checkpoint.store(job.chunk(), result) {
                log::error!("Could not write checkpoint for {}: {}", job.window(), e.display());
            }
        }
    }

    fn report(&self, chrom: &str, jobs: &[Job]) {
        if let Some(status) = &self.status {
            status.update_jobs(chrom, jobs.iter().map(|job| (job.index(), job.state(), job.retries())));
        }
    }

    fn outcome(chrom: &str, job: Job) -> Result<Arc<ChunkResult>, Error> {
        match job.state() {
            JobState::Succeeded => job.result().cloned()
                .ok_or_else(|| Error::RuntimeError(format!("{} succeeded without a result", job.window()))),
            JobState::FatallyFailed(reason) => Err(Error::FatallyFailed {
                chrom: chrom.to_owned(),
                window: job.index(),
                attempts: job.attempt(),
                reason: reason.clone(),
            }),
            state => Err(Error::Cancelled(format!("{} is {}", job.window(), state))),
        }
    }
}

/// Work directory for the chromosome.
pub fn chrom_dir(work_dir: &Path, chrom: &str) -> PathBuf {
    work_dir.join(chrom)
}
