//! Per-window jobs and their lifecycle.

use std::{
    fmt,
    sync::Arc,
    time::Instant,
};
use crate::{
    Error,
    genome::Record,
    plan::{Window, Chunk, ChunkData},
};
use super::backend::Handle;

/// Job state.
///
/// ```text
/// Pending -> Submitted -> Running -> Succeeded
///    ^           |           |
///    |           +-----------+-----> Failed | Preempted -> FatallyFailed
///    +-------------------------------------+
/// ```
/// Any non-terminal state may also become `Cancelled`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Succeeded,
    /// Attempt failed with the given reason.
    Failed(String),
    /// Attempt was preempted by the backend.
    Preempted,
    /// Retry budget exhausted, last failure reason.
    FatallyFailed(String),
    Cancelled,
}

impl JobState {
    /// Returns true if the job will never change its state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FatallyFailed(_) | Self::Cancelled)
    }

    /// Returns true if the job is currently occupying a backend slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Preempted => "preempted",
            Self::FatallyFailed(_) => "fatally-failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Checks if the transition `self -> next` is allowed.
    fn can_become(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            // Restored from a checkpoint, empty chunk, or failed submission.
            (Pending, Submitted) | (Pending, Succeeded) | (Pending, Failed(_)) | (Pending, Cancelled) => true,
            // Fast tasks may finish before they were observed running.
            (Submitted, Running) | (Submitted, Succeeded) | (Submitted, Failed(_))
                | (Submitted, Preempted) | (Submitted, Cancelled) => true,
            (Running, Succeeded) | (Running, Failed(_)) | (Running, Preempted) | (Running, Cancelled) => true,
            (Failed(_), Pending) | (Failed(_), FatallyFailed(_)) | (Failed(_), Cancelled) => true,
            (Preempted, Pending) | (Preempted, FatallyFailed(_)) | (Preempted, Cancelled) => true,
            (Pending, _) | (Submitted, _) | (Running, _) | (Failed(_), _) | (Preempted, _) => false,
            (Succeeded, _) | (FatallyFailed(_), _) | (Cancelled, _) => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Failed(reason) | Self::FatallyFailed(reason) => write!(f, "{} ({})", self.name(), reason),
            _ => f.write_str(self.name()),
        }
    }
}

/// Output of a single window, produced by a successful attempt. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkResult {
    window: Window,
    attempt: u32,
    data: ChunkData,
}

impl ChunkResult {
    pub fn new(window: Window, attempt: u32, records: Vec<Record>) -> Self {
        Self {
            window, attempt,
            data: ChunkData::Records(records),
        }
    }

    /// Result of an explicitly empty chunk. No worker is run for it.
    pub fn empty(window: Window) -> Self {
        Self {
            window,
            attempt: 0,
            data: ChunkData::Empty,
        }
    }

    pub(crate) fn from_data(window: Window, attempt: u32, data: ChunkData) -> Self {
        Self { window, attempt, data }
    }

    #[inline]
    pub fn window(&self) -> &Window {
        &self.window
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.window.index()
    }

    /// Attempt that produced this result (0 for empty chunks and checkpoints without attempt information).
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    #[inline]
    pub fn records(&self) -> &[Record] {
        self.data.records()
    }
}

/// Single job: chunk and its processing state.
pub struct Job {
    chunk: Arc<Chunk>,
    state: JobState,
    /// Number of started attempts.
    attempt: u32,
    handle: Option<Handle>,
    /// When the current attempt was first observed running.
    started_at: Option<Instant>,
    /// Do not resubmit before this moment.
    not_before: Option<Instant>,
    result: Option<Arc<ChunkResult>>,
    last_error: Option<String>,
}

impl Job {
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk: Arc::new(chunk),
            state: JobState::Pending,
            attempt: 0,
            handle: None,
            started_at: None,
            not_before: None,
            result: None,
            last_error: None,
        }
    }

    #[inline]
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    #[inline]
    pub fn window(&self) -> &Window {
        self.chunk.window()
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.chunk.index()
    }

    #[inline]
    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Number of started attempts.
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Number of resubmissions.
    #[inline]
    pub fn retries(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    #[inline]
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    pub fn result(&self) -> Option<&Arc<ChunkResult>> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Running time of the current attempt. `None` while the task waits in the backend queue.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Returns true if the job can be submitted now.
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.state == JobState::Pending && self.not_before.map(|t| t <= now).unwrap_or(true)
    }

    /// Moves the job into the new state, returns an error if the transition is not allowed.
    pub(crate) fn transition(&mut self, next: JobState) -> Result<(), Error> {
        if !self.state.can_become(&next) {
            return Err(Error::RuntimeError(format!("{}: illegal job transition {} -> {}",
                self.window(), self.state, next)));
        }
        log::debug!("{}: {} -> {}", self.window(), self.state, next);
        match &next {
            JobState::Running => self.started_at = Some(Instant::now()),
            JobState::Failed(reason) | JobState::FatallyFailed(reason) => self.last_error = Some(reason.clone()),
            JobState::Preempted => self.last_error = Some("preempted".to_owned()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Starts a new attempt with the backend handle.
    pub(crate) fn start_attempt(&mut self, handle: Handle) -> Result<(), Error> {
        self.transition(JobState::Submitted)?;
        self.handle = Some(handle);
        self.started_at = None;
        Ok(())
    }

    pub(crate) fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub(crate) fn take_handle(&mut self) -> Option<Handle> {
        self.handle.take()
    }

    pub(crate) fn delay_until(&mut self, t: Instant) {
        self.not_before = Some(t);
    }

    /// Marks the job as succeeded with a result, restored from a previous run.
    pub(crate) fn restore(&mut self, result: ChunkResult) -> Result<(), Error> {
        self.transition(JobState::Succeeded)?;
        self.attempt = result.attempt();
        self.result = Some(Arc::new(result));
        Ok(())
    }

    /// Records successful result. Results of stale attempts are discarded.
    pub(crate) fn succeed(&mut self, result: ChunkResult) -> Result<bool, Error> {
        if result.attempt() != self.attempt {
            log::warn!("{}: discarding stale result of attempt {} (current attempt {})",
                self.window(), result.attempt(), self.attempt);
            return Ok(false);
        }
        self.transition(JobState::Succeeded)?;
        self.handle = None;
        self.result = Some(Arc::new(result));
        Ok(true)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Job({:?}, {}, attempt {})", self.window(), self.state, self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::{
        genome::{Chromosome, GeneticMap, Span},
        plan::{self, EmptyPolicy},
    };

    fn job() -> Job {
        let records = (0..45).step_by(3).map(|p| Record::new(p, "x")).collect();
        let chrom = Chromosome::new("chr1", records, Arc::new(GeneticMap::uniform())).unwrap()
            .with_extent(Span::new(0, 45)).unwrap();
        let windows = plan::plan("chr1", chrom.extent(), 20, 5).unwrap();
        Job::new(plan::extract(&chrom, &windows[1], EmptyPolicy::Fail).unwrap())
    }

    #[test]
    fn lifecycle() {
        let mut job = job();
        assert_eq!(job.state(), &JobState::Pending);
        assert_eq!(job.next_attempt(), 1);
        job.start_attempt(Handle(3)).unwrap();
        assert_eq!(job.elapsed(), None);
        job.transition(JobState::Running).unwrap();
        assert!(job.elapsed().is_some());
        job.transition(JobState::Failed("exit code 1".to_owned())).unwrap();
        assert_eq!(job.last_error(), Some("exit code 1"));
        job.transition(JobState::Pending).unwrap();
        assert_eq!(job.next_attempt(), 2);
        job.start_attempt(Handle(4)).unwrap();
        assert_eq!(job.elapsed(), None);
        let result = ChunkResult::new(job.window().clone(), 2, job.chunk().records().to_vec());
        assert!(job.succeed(result).unwrap());
        assert!(job.state().is_terminal());
        assert_eq!(job.retries(), 1);
        assert_eq!(job.result().unwrap().attempt(), 2);
    }

    #[test]
    fn illegal_transitions() {
        let mut job = job();
        assert!(job.transition(JobState::Running).is_err());
        assert!(job.transition(JobState::FatallyFailed("x".to_owned())).is_err());
        job.transition(JobState::Cancelled).unwrap();
        assert!(job.transition(JobState::Pending).is_err());
        assert!(job.transition(JobState::Succeeded).is_err());
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut job = job();
        job.next_attempt();
        job.start_attempt(Handle(1)).unwrap();
        job.transition(JobState::Preempted).unwrap();
        job.transition(JobState::Pending).unwrap();
        job.next_attempt();
        job.start_attempt(Handle(2)).unwrap();
        let stale = ChunkResult::new(job.window().clone(), 1, Vec::new());
        assert!(!job.succeed(stale).unwrap());
        assert_eq!(job.state(), &JobState::Submitted);
        let fresh = ChunkResult::new(job.window().clone(), 2, job.chunk().records().to_vec());
        assert!(job.succeed(fresh).unwrap());
    }
}
