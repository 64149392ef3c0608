//! Shared run status: per-chromosome state and per-job retry counts.

use std::{
    collections::BTreeMap,
    fmt::{self, Write},
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use crate::{
    dispatch::JobState,
    ext,
};

/// State of a single chromosome.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ChromState {
    /// Waiting for a free chromosome thread.
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed(String),
}

impl ChromState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

impl fmt::Display for ChromState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in progress"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub retries: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ChromStatus {
    pub state: ChromState,
    /// Jobs by window index.
    pub jobs: BTreeMap<usize, JobStatus>,
}

impl ChromStatus {
    pub fn total_retries(&self) -> u32 {
        self.jobs.values().map(|job| job.retries).sum()
    }

    pub fn n_succeeded(&self) -> usize {
        self.jobs.values().filter(|job| job.state == JobState::Succeeded).count()
    }
}

/// Thread-safe status of the whole run.
pub struct RunStatus {
    chroms: Mutex<BTreeMap<String, ChromStatus>>,
    start: Instant,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatus {
    pub fn new() -> Self {
        Self {
            chroms: Mutex::new(BTreeMap::new()),
            start: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ChromStatus>> {
        self.chroms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds the chromosome in the `Pending` state, if not present yet.
    pub fn register(&self, chrom: &str) {
        self.lock().entry(chrom.to_owned()).or_default();
    }

    pub fn set_state(&self, chrom: &str, state: ChromState) {
        self.lock().entry(chrom.to_owned()).or_default().state = state;
    }

    /// Updates states of the jobs: `(window index, state, number of retries)`.
    pub fn update_jobs<'a>(&self, chrom: &str, jobs: impl Iterator<Item = (usize, &'a JobState, u32)>) {
        let mut chroms = self.lock();
        let entry = chroms.entry(chrom.to_owned()).or_default();
        for (index, state, retries) in jobs {
            let status = JobStatus { state: state.clone(), retries };
            if entry.jobs.get(&index) != Some(&status) {
                entry.jobs.insert(index, status);
            }
        }
    }

    pub fn chrom(&self, chrom: &str) -> Option<ChromStatus> {
        self.lock().get(chrom).cloned()
    }

    pub fn chrom_state(&self, chrom: &str) -> Option<ChromState> {
        self.lock().get(chrom).map(|status| status.state.clone())
    }

    /// Number of retries of a single job.
    pub fn retries(&self, chrom: &str, window: usize) -> Option<u32> {
        self.lock().get(chrom).and_then(|status| status.jobs.get(&window)).map(|job| job.retries)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ChromStatus> {
        self.lock().clone()
    }

    pub fn all_succeeded(&self) -> bool {
        self.lock().values().all(|status| status.state == ChromState::Succeeded)
    }

    /// Names of the failed chromosomes together with failure reasons.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.lock().iter().filter_map(|(name, status)| match &status.state {
            ChromState::Failed(reason) => Some((name.clone(), reason.clone())),
            _ => None,
        }).collect()
    }

    /// Printable table: one line per chromosome.
    pub fn summary(&self) -> String {
        let chroms = self.lock();
        let mut s = String::new();
        writeln!(s, "Elapsed {}", ext::fmt::Duration(self.start.elapsed())).unwrap();
        for (name, status) in chroms.iter() {
            writeln!(s, "{:<10}  {:>4} / {:<4} windows  {:>3} retries  {}", name, status.n_succeeded(),
                status.jobs.len(), status.total_retries(), status.state).unwrap();
        }
        s
    }
}
