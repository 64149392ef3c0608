//! Chunk extractor: materializes records that fall into a window.

use std::{
    fmt,
    hash::Hasher,
    io::Write,
    path::Path,
    str::FromStr,
};
use crate::{
    Error,
    err::error,
    ext,
    genome::{Chromosome, Record},
};
use super::Window;

/// What to do with windows without any records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmptyPolicy {
    /// Raise `EmptyWindow` error.
    Fail,
    /// Propagate an explicitly empty chunk.
    Allow,
}

impl FromStr for EmptyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase() as &str {
            "fail" => Ok(Self::Fail),
            "allow" => Ok(Self::Allow),
            _ => Err(format!("Unknown empty window policy {:?} (possible values: fail, allow)", s)),
        }
    }
}

impl fmt::Display for EmptyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Fail => "fail",
            Self::Allow => "allow",
        })
    }
}

/// Chunk contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkData {
    /// Records, sorted by position.
    Records(Vec<Record>),
    /// Window legitimately contains no records.
    Empty,
}

impl ChunkData {
    pub fn records(&self) -> &[Record] {
        match self {
            Self::Records(records) => records,
            Self::Empty => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Input of a single job: window together with its records.
#[derive(Clone, Debug)]
pub struct Chunk {
    window: Window,
    /// Physical region, corresponding to the window (`chrom:start-end`).
    region: String,
    data: ChunkData,
}

impl Chunk {
    #[inline]
    pub fn window(&self) -> &Window {
        &self.window
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.window.index()
    }

    #[inline]
    pub fn region(&self) -> &str {
        &self.region
    }

    #[inline]
    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    #[inline]
    pub fn records(&self) -> &[Record] {
        self.data.records()
    }

    /// Returns true if this is an explicitly empty chunk.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate size of the chunk in bytes, when written into a text file.
    pub fn text_size(&self) -> u64 {
        self.records().iter().map(|rec| rec.text_size() as u64).sum()
    }

    /// Hash of the chunk region and records, identifies the job input across runs.
    pub fn digest(&self) -> u64 {
        let mut hasher = wyhash::WyHash::with_seed(0);
        hasher.write(self.region.as_bytes());
        hasher.write_u8(self.data.is_empty() as u8);
        for rec in self.records() {
            hasher.write_u32(rec.pos());
            hasher.write_usize(rec.data().len());
            hasher.write(rec.data().as_bytes());
        }
        hasher.finish()
    }

    /// Writes chunk records as `pos<TAB>data` lines.
    pub fn write_records(&self, mut out: impl Write) -> std::io::Result<()> {
        for rec in self.records() {
            writeln!(out, "{}", rec)?;
        }
        Ok(())
    }
}

/// Extracts records with genetic coordinates in `[window.start, window.end)`, preserving their order.
pub fn extract(chrom: &Chromosome, window: &Window, policy: EmptyPolicy) -> Result<Chunk, Error> {
    if chrom.name() != window.chrom() {
        return Err(error!(InvalidInput, "Cannot extract {} from chromosome {}", window, chrom.name()));
    }
    let range = chrom.range_in(&window.span());
    let data = if range.is_empty() {
        match policy {
            EmptyPolicy::Fail => return Err(Error::EmptyWindow(chrom.name().to_owned(), window.index())),
            EmptyPolicy::Allow => {
                log::debug!("{} contains no records", window);
                ChunkData::Empty
            }
        }
    } else {
        ChunkData::Records(chrom.records()[range].to_vec())
    };
    Ok(Chunk {
        window: window.clone(),
        region: chrom.region(&window.span()),
        data,
    })
}

/// Extracts chunks for all windows.
pub fn extract_all(chrom: &Chromosome, windows: &[Window], policy: EmptyPolicy) -> Result<Vec<Chunk>, Error> {
    let chunks = windows.iter().map(|window| extract(chrom, window, policy)).collect::<Result<Vec<_>, _>>()?;
    let n_empty = chunks.iter().filter(|chunk| chunk.is_empty()).count();
    if n_empty > 0 {
        log::warn!("{}: {} / {} windows contain no records", chrom.name(), n_empty, chunks.len());
    }
    Ok(chunks)
}

/// Writes `region<TAB>index` line for each chunk.
pub fn write_regions(filename: &Path, chunks: &[Chunk]) -> Result<(), Error> {
    ext::sys::write_atomic(filename, |out| {
        for chunk in chunks {
            writeln!(out, "{}\t{}", chunk.region(), chunk.index())?;
        }
        Ok(())
    })
}
