//! Chromosome-scale scatter-gather: splits chromosomes into overlapping genetic-distance windows,
//! runs an opaque worker on every window through a pluggable backend,
//! and ligates per-window outputs back into one consistent chromosome-wide result.

pub mod ext;
pub mod genome;
pub mod plan;
pub mod dispatch;
pub mod ligate;
pub mod pipeline;

mod err;
pub use err::{Error, Result};
