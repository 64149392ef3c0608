//! Genotype records, chromosomes and genetic maps, as well as reading and writing them.

pub mod genmap;
pub mod chrom;
pub mod source;
pub mod sink;

use std::fmt;

pub use genmap::GeneticMap;
pub use chrom::Chromosome;

/// Genetic coordinates are stored as integers in units of 1e-6 cM.
/// At the average rate of 1 cM/Mb, one unit corresponds to one base pair.
pub const UNITS_PER_CM: u64 = 1_000_000;

/// Converts centiMorgans into genetic units. Returns None for negative or non-finite values.
pub fn cm_to_units(cm: f64) -> Option<u64> {
    if cm.is_finite() && cm >= 0.0 {
        Some((cm * UNITS_PER_CM as f64).round() as u64)
    } else {
        None
    }
}

/// Single genotype record: 1-based physical position and an opaque payload
/// (for example, the rest of a VCF line).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Record {
    pos: u32,
    data: Box<str>,
}

impl Record {
    pub fn new(pos: u32, data: impl Into<Box<str>>) -> Self {
        Self { pos, data: data.into() }
    }

    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    #[inline]
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Approximate number of bytes, occupied by the record in a text file.
    pub fn text_size(&self) -> usize {
        // Position, tab and newline.
        12 + self.data.len()
    }

    /// Parses `pos<TAB>data` line. Data may be missing.
    pub fn parse(line: &str) -> Result<Self, String> {
        let (pos, data) = line.split_once('\t').unwrap_or((line, ""));
        let pos: u32 = pos.trim().parse()
            .map_err(|_| format!("Cannot parse record position from '{}'", line))?;
        Ok(Self::new(pos, data))
    }
}

impl fmt::Display for Record {
    /// Writes `pos<TAB>data`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}\t{}", self.pos, self.data)
    }
}

/// Half-open interval `[start, end)` of genetic coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "Cannot create span [{}, {})", start, end);
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn contains(&self, coord: u64) -> bool {
        self.start <= coord && coord < self.end
    }

    /// Returns true if `other` lies completely within this span.
    pub fn covers(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection of two spans, None if they do not overlap.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end { Some(Span { start, end }) } else { None }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
