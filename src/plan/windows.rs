//! Window planner: overlapping windows, covering the whole chromosome.

use std::{
    fmt,
    sync::Arc,
};
use crate::{
    Error,
    err::{validate_param, error},
    ext::{
        ser::{JsonSer, json_get},
        fmt::Cm,
    },
    genome::{Span, Chromosome, cm_to_units},
};

/// Single window over one chromosome, in genetic coordinates.
///
/// `[start, overlap_start)` is shared with the previous window,
/// `[overlap_end, end)` is shared with the next window.
/// For the first window `overlap_start == start`, for the last window `overlap_end == end`.
#[derive(Clone, PartialEq, Eq)]
pub struct Window {
    chrom: Arc<str>,
    index: usize,
    start: u64,
    end: u64,
    overlap_start: u64,
    overlap_end: u64,
}

impl Window {
    #[inline]
    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    /// Index of the window within the chromosome (0-based).
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub fn overlap_start(&self) -> u64 {
        self.overlap_start
    }

    #[inline]
    pub fn overlap_end(&self) -> u64 {
        self.overlap_end
    }

    /// Full window span `[start, end)`.
    #[inline]
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Region, shared with the previous window. None for the first window.
    pub fn left_overlap(&self) -> Option<Span> {
        if self.overlap_start > self.start { Some(Span::new(self.start, self.overlap_start)) } else { None }
    }

    /// Region, shared with the next window. None for the last window.
    pub fn right_overlap(&self) -> Option<Span> {
        if self.overlap_end < self.end { Some(Span::new(self.overlap_end, self.end)) } else { None }
    }

    /// Window key, unique within a run: used for naming attempt directories and checkpoints.
    pub fn key(&self) -> String {
        format!("{}.{:04}", self.chrom, self.index)
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}[{}, {} | {}, {})", self.chrom, self.index,
            self.start, self.overlap_start, self.overlap_end, self.end)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} window {} [{}, {})", self.chrom, self.index, self.start, self.end)
    }
}

impl JsonSer for Window {
    fn save(&self) -> json::JsonValue {
        json::object!{
            chrom: &*self.chrom,
            index: self.index,
            start: self.start,
            end: self.end,
            overlap_start: self.overlap_start,
            overlap_end: self.overlap_end,
        }
    }

    fn load(obj: &json::JsonValue) -> Result<Self, Error> {
        json_get!(obj -> chrom (as_str), index (as_usize), start (as_u64), end (as_u64),
            overlap_start (as_u64), overlap_end (as_u64));
        if !(start <= overlap_start && overlap_start <= end && start <= overlap_end && overlap_end <= end) {
            return Err(error!(JsonLoad, "Invalid window bounds in '{}'", obj));
        }
        Ok(Self {
            chrom: Arc::from(chrom),
            index, start, end, overlap_start, overlap_end,
        })
    }
}

/// Splits the extent into windows of `chunk_size` with `overlap_size` shared between consecutive windows.
/// All values are in genetic units.
///
/// Windows start at the beginning of the extent and advance by `chunk_size - overlap_size`.
/// The last window is clipped to the end of the extent.
/// `overlap_size` may not exceed half of `chunk_size`, so that no coordinate is covered by three windows.
pub fn plan(chrom: &str, extent: Span, chunk_size: u64, overlap_size: u64) -> Result<Vec<Window>, Error> {
    validate_param!(chunk_size > 0, "Chunk size must be positive");
    validate_param!(overlap_size > 0, "Overlap size must be positive");
    validate_param!(overlap_size < chunk_size,
        "Overlap size ({}) must be smaller than the chunk size ({})", overlap_size, chunk_size);
    validate_param!(overlap_size <= chunk_size / 2,
        "Overlap size ({}) must not exceed half of the chunk size ({})", overlap_size, chunk_size);
    validate_param!(!extent.is_empty(), "Cannot split empty extent {} of {}", extent, chrom);

    let chrom: Arc<str> = Arc::from(chrom);
    let stride = chunk_size - overlap_size;
    let mut windows = Vec::new();
    let mut start = extent.start;
    loop {
        let end = start.saturating_add(chunk_size).min(extent.end);
        let is_last = end == extent.end;
        windows.push(Window {
            chrom: Arc::clone(&chrom),
            index: windows.len(),
            start, end,
            overlap_start: if windows.is_empty() { start } else { (start + overlap_size).min(end) },
            overlap_end: if is_last { end } else { end - overlap_size },
        });
        if is_last {
            break;
        }
        start += stride;
    }
    check_consistency(&windows, overlap_size)?;
    log::debug!("{}: {} windows of {} with {} overlap over {}", chrom, windows.len(),
        Cm(chunk_size), Cm(overlap_size), extent);
    Ok(windows)
}

/// Checks that each pair of consecutive windows agrees on their shared overlap.
fn check_consistency(windows: &[Window], overlap_size: u64) -> Result<(), Error> {
    for pair in windows.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.start <= prev.start {
            return Err(Error::InconsistentWindowing(format!("{:?} does not start after {:?}", next, prev)));
        }
        let trailing = Span::new(prev.end.saturating_sub(overlap_size), prev.end);
        let leading = Span::new(next.start, next.start + overlap_size);
        let declared = (prev.right_overlap(), next.left_overlap());
        match (trailing.intersect(&leading), declared) {
            (Some(shared), (Some(right), Some(left))) if shared == trailing && shared == leading
                && shared == right && shared == left => {}
            _ => return Err(Error::InconsistentWindowing(format!(
                "{:?} and {:?} do not share an overlap of size {}", prev, next, overlap_size))),
        }
    }
    Ok(())
}

/// Window sizes in centiMorgans.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowParams {
    pub chunk_size_cm: f64,
    pub overlap_cm: f64,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            chunk_size_cm: 20.0,
            overlap_cm: 2.0,
        }
    }
}

impl WindowParams {
    /// Checks the sizes both in centiMorgans and after conversion to genetic units.
    pub fn validate(&self) -> Result<(), Error> {
        self.units().map(|_| ())
    }

    /// Chunk and overlap sizes in genetic units.
    pub fn units(&self) -> Result<(u64, u64), Error> {
        validate_param!(self.chunk_size_cm.is_finite() && self.chunk_size_cm > 0.0,
            "Chunk size ({} cM) must be positive", self.chunk_size_cm);
        validate_param!(self.overlap_cm.is_finite() && self.overlap_cm > 0.0,
            "Overlap size ({} cM) must be positive", self.overlap_cm);
        validate_param!(self.overlap_cm < self.chunk_size_cm,
            "Overlap size ({} cM) must be smaller than the chunk size ({} cM)", self.overlap_cm, self.chunk_size_cm);
        let (chunk, overlap) = match (cm_to_units(self.chunk_size_cm), cm_to_units(self.overlap_cm)) {
            (Some(chunk), Some(overlap)) => (chunk, overlap),
            _ => return Err(error!(InvalidConfig, "Cannot convert window sizes ({} cM, {} cM) to genetic units",
                self.chunk_size_cm, self.overlap_cm)),
        };
        validate_param!(chunk > 0 && overlap > 0,
            "Window sizes ({} cM, {} cM) are below the genetic unit resolution", self.chunk_size_cm, self.overlap_cm);
        validate_param!(overlap <= chunk / 2,
            "Overlap size ({}) must not exceed half of the chunk size ({})", Cm(overlap), Cm(chunk));
        Ok((chunk, overlap))
    }

    /// Plans windows over the whole chromosome extent.
    pub fn plan(&self, chrom: &Chromosome) -> Result<Vec<Window>, Error> {
        let (chunk_size, overlap_size) = self.units()?;
        plan(chrom.name(), chrom.extent(), chunk_size, overlap_size)
    }
}

impl JsonSer for WindowParams {
    fn save(&self) -> json::JsonValue {
        json::object!{
            chunk_size_cm: self.chunk_size_cm,
            overlap_cm: self.overlap_cm,
        }
    }

    fn load(obj: &json::JsonValue) -> Result<Self, Error> {
        json_get!(obj -> chunk_size_cm (as_f64), overlap_cm (as_f64));
        Ok(Self { chunk_size_cm, overlap_cm })
    }
}
