//! Splitting chromosomes into overlapping windows and extracting the corresponding chunks.

pub mod windows;
pub mod chunk;

pub use windows::{Window, WindowParams, plan};
pub use chunk::{Chunk, ChunkData, EmptyPolicy, extract, extract_all};
