//! Execution backend boundary: anything that can run a chunk and report back.

use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
};
use crate::{
    Error,
    genome::Record,
    plan::Chunk,
};
use super::worker::AlgoConfig;

/// Opaque identifier of a backend task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl nohash::IsEnabled for Handle {}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a backend task, as observed by polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Preempted,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Memory class of the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemClass {
    Standard,
    HighMem,
}

impl fmt::Display for MemClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::HighMem => "highmem",
        })
    }
}

const GB: f64 = 1e9;

/// Resources, requested for a single task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resources {
    pub cpus: u16,
    pub memory: MemClass,
    /// Storage in GiB.
    pub storage_gb: u32,
}

impl Resources {
    /// Estimates resources from the chunk size:
    /// high memory for chunks over 1 GB, and `5 + 3 * size` GB of storage.
    pub fn estimate(chunk: &Chunk, cpus: u16) -> Self {
        let size = chunk.text_size() as f64 / GB;
        Self {
            cpus,
            memory: if size > 1.0 { MemClass::HighMem } else { MemClass::Standard },
            storage_gb: (5.0 + 3.0 * size).round() as u32,
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} cpu, {} memory, {} GB storage", self.cpus, self.memory, self.storage_gb)
    }
}

/// Everything a backend needs to run one attempt of one chunk.
#[derive(Clone)]
pub struct TaskSpec {
    /// Human readable task name (`chrom.0003.a2`).
    pub name: String,
    pub chunk: Arc<Chunk>,
    pub attempt: u32,
    /// Attempt-scoped working directory.
    pub work_dir: PathBuf,
    pub resources: Resources,
    pub algo: Arc<AlgoConfig>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskSpec({}, {}, {})", self.name, self.chunk.region(), self.resources)
    }
}

/// Execution backend. Calls never block on the task itself.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Starts a new task.
    fn submit(&self, task: TaskSpec) -> Result<Handle, Error>;

    /// Returns current state of the task.
    fn poll(&self, handle: Handle) -> Result<TaskState, Error>;

    /// Requests task cancellation (best effort).
    fn cancel(&self, handle: Handle) -> Result<(), Error>;

    /// Fetches output of a succeeded task.
    fn fetch_output(&self, handle: Handle) -> Result<Vec<Record>, Error>;

    /// Forgets the task. Called once the dispatcher no longer needs it.
    fn release(&self, _handle: Handle) {}
}
