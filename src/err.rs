use std::{
    io,
    fmt::Write,
    path::PathBuf,
};
use colored::Colorize;
use crate::ext;

/// General enum, representing possible errors.
#[derive(Debug)]
pub enum Error {
    Io(io::Error, Vec<PathBuf>),
    /// Bad windowing or dispatch parameters, detected before anything is run.
    InvalidConfig(String),
    /// Adjacent windows disagree on their shared overlap.
    InconsistentWindowing(String),
    /// Window contains no records, while empty windows are not allowed: `(chrom, window index)`.
    EmptyWindow(String, usize),
    /// Single job attempt failed. Never surfaced on its own, only retried or wrapped into `FatallyFailed`.
    JobFailed(String),
    /// Single job attempt was preempted by the backend. Retried in the same way as `JobFailed`.
    JobPreempted(String),
    /// Job exhausted its retry budget.
    FatallyFailed {
        chrom: String,
        window: usize,
        attempts: u32,
        reason: String,
    },
    /// Some windows have no successful result at merge time.
    IncompleteChromosome {
        chrom: String,
        missing: Vec<usize>,
    },
    /// Chunk result does not agree with its window or with its neighbour.
    OverlapMismatch {
        chrom: String,
        window: usize,
        reason: String,
    },
    /// Run was cancelled before the chromosome finished.
    Cancelled(String),
    /// Executable not found.
    NoExec(PathBuf),
    InvalidInput(String),
    InvalidData(String),
    ParsingError(String),
    RuntimeError(String),
    JsonLoad(String),
}

impl From<json::JsonError> for Error {
    fn from(e: json::JsonError) -> Self {
        Self::JsonLoad(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e, Vec::new())
    }
}

impl Error {
    /// Format error message.
    pub fn display(&self) -> String {
        let mut s = String::new();
        match self {
            Self::Io(e, files) => {
                write!(s, "{} in relation to ", "Input/Output error".red()).unwrap();
                if files.is_empty() {
                    write!(s, "unnamed streams").unwrap();
                } else {
                    write!(s, "{}", files.iter().map(|f| ext::fmt::path(f).cyan().to_string())
                        .collect::<Vec<_>>().join(", ")).unwrap();
                }
                write!(s, ": {}", e.kind()).unwrap();
                if let Some(e2) = e.get_ref() {
                    write!(s, ", {}", e2).unwrap();
                }
            }
            Self::InvalidConfig(e) => write!(s, "{}: {}", "Invalid configuration".red(), e).unwrap(),
            Self::InconsistentWindowing(e) => write!(s, "{}: {}", "Inconsistent windowing".red(), e).unwrap(),
            Self::EmptyWindow(chrom, window) => write!(s, "{}: window {} on {} contains no records",
                "Empty window".red(), window, chrom.cyan()).unwrap(),
            Self::JobFailed(e) => write!(s, "{}: {}", "Job failed".red(), e).unwrap(),
            Self::JobPreempted(e) => write!(s, "{}: {}", "Job preempted".yellow(), e).unwrap(),
            Self::FatallyFailed { chrom, window, attempts, reason } =>
                write!(s, "{}: window {} on {} failed {} times, last error: {}",
                    "Job fatally failed".red(), window, chrom.cyan(), attempts, reason).unwrap(),
            Self::IncompleteChromosome { chrom, missing } =>
                write!(s, "{}: {} has no results for windows {:?}",
                    "Incomplete chromosome".red(), chrom.cyan(), missing).unwrap(),
            Self::OverlapMismatch { chrom, window, reason } =>
                write!(s, "{}: window {} on {}: {}", "Overlap mismatch".red(), window, chrom.cyan(), reason).unwrap(),
            Self::Cancelled(e) => write!(s, "{}: {}", "Cancelled".yellow(), e).unwrap(),
            Self::NoExec(path) => write!(s, "{} at {}", "Could not find executable".red(),
                ext::fmt::path(path).cyan()).unwrap(),
            Self::InvalidInput(e) => write!(s, "{}: {}", "Invalid input".red(), e).unwrap(),
            Self::InvalidData(e) => write!(s, "{}: {}", "Invalid data".red(), e).unwrap(),
            Self::ParsingError(e) => write!(s, "{}: {}", "Parsing error".red(), e).unwrap(),
            Self::RuntimeError(e) => write!(s, "{}: {}", "Runtime error".red(), e).unwrap(),
            Self::JsonLoad(e) => write!(s, "{}: {}", "Could not load JSON".red(), e).unwrap(),
        };
        s
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

impl std::error::Error for Error {}

macro_rules! validate_param {
    ($cond:expr, $($arg:expr),+) => {{
        if !($cond) {
            (
                Err($crate::Error::InvalidConfig(format!($($arg),+)))
            ?)
        }
    }};
}
pub(crate) use validate_param;

macro_rules! add_path {
    (!) => {
        |e| $crate::Error::Io(e, Vec::new())
    };
    ($path:expr) => {
        |e| $crate::Error::Io(e, vec![std::convert::AsRef::<std::path::Path>::as_ref(&$path).to_owned()])
    };
    ($($path:expr),+) => {
        |e| {
            let mut v = Vec::new();
            $(
                v.push(std::convert::AsRef::<std::path::Path>::as_ref(&$path).to_owned());
            )*
            $crate::Error::Io(e, v)
        }
    };
}
pub(crate) use add_path;

macro_rules! error {
    ($var:ident, $($arg:expr),+ $(,)?) => {
        $crate::Error::$var(format!($($arg),+))
    }
}
pub(crate) use error;

/// Wrapper around the standard result.
pub type Result<T> = std::result::Result<T, Error>;
