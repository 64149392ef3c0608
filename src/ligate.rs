//! Ligation: trims window overlaps and stitches chunk results into one chromosome-wide output.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::Arc,
};
use crate::{
    Error,
    dispatch::ChunkResult,
    genome::{Chromosome, GeneticMap, Record, Span},
    plan::Window,
};

/// Where to cut the overlap between two adjacent windows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Overlap is taken from the earlier window (cut at the end of the overlap).
    #[default]
    PreferEarlier,
    /// Overlap is taken from the later window (cut at the start of the overlap).
    PreferLater,
    /// Cut in the middle of the overlap (rounded down).
    Midpoint,
}

impl TieBreak {
    /// Cut coordinate for the shared region `[overlap.start, overlap.end)`:
    /// the earlier window keeps coordinates below the cut, the later window keeps the rest.
    pub fn cut(self, overlap: Span) -> u64 {
        match self {
            Self::PreferEarlier => overlap.end,
            Self::PreferLater => overlap.start,
            Self::Midpoint => overlap.start + overlap.len() / 2,
        }
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase() as &str {
            "earlier" | "prefer-earlier" => Ok(Self::PreferEarlier),
            "later" | "prefer-later" => Ok(Self::PreferLater),
            "mid" | "midpoint" => Ok(Self::Midpoint),
            _ => Err(format!("Unknown tie-break rule {:?} (possible values: earlier, later, midpoint)", s)),
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::PreferEarlier => "earlier",
            Self::PreferLater => "later",
            Self::Midpoint => "midpoint",
        })
    }
}

/// Ligated records of one chromosome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedOutput {
    chrom: String,
    /// Genetic span, equal to the chromosome extent.
    span: Span,
    records: Vec<Record>,
    /// Number of records, taken from each window.
    contributions: Vec<usize>,
}

impl MergedOutput {
    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    pub fn span(&self) -> Span {
        self.span
    }

    /// Records, strictly increasing by position.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contributions(&self) -> &[usize] {
        &self.contributions
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

fn mismatch(chrom: &str, window: usize, reason: String) -> Error {
    Error::OverlapMismatch {
        chrom: chrom.to_owned(),
        window,
        reason,
    }
}

/// Checks that windows start at the extent start, end at the extent end,
/// and that each window starts exactly where the previous one stops being exclusive.
fn check_tiling(chrom: &str, extent: Span, windows: &[Window]) -> Result<(), Error> {
    let incomplete = |i: usize| Error::IncompleteChromosome { chrom: chrom.to_owned(), missing: vec![i] };
    let (Some(first), Some(last)) = (windows.first(), windows.last()) else {
        return Err(incomplete(0));
    };
    if first.start() != extent.start {
        return Err(incomplete(0));
    }
    if last.end() != extent.end {
        return Err(incomplete(last.index() + 1));
    }
    for (i, pair) in windows.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.index() != i || next.index() != i + 1 {
            return Err(Error::InconsistentWindowing(format!("Windows on {} are not ordered by index", chrom)));
        }
        if next.start() != prev.overlap_end() || prev.end() != next.overlap_start() {
            return Err(incomplete(i + 1));
        }
    }
    Ok(())
}

/// Validates the result against its window: records must be strictly sorted and fall into the window.
fn check_result(chrom: &str, map: &GeneticMap, window: &Window, result: &ChunkResult) -> Result<(), Error> {
    if result.window() != window {
        return Err(mismatch(chrom, window.index(),
            format!("result was produced for {:?}, expected {:?}", result.window(), window)));
    }
    let records = result.records();
    for pair in records.windows(2) {
        if pair[0].pos() >= pair[1].pos() {
            return Err(mismatch(chrom, window.index(),
                format!("records are not strictly sorted ({} followed by {})", pair[0].pos(), pair[1].pos())));
        }
    }
    let span = window.span();
    if let Some(rec) = records.iter().find(|rec| !span.contains(map.coord(rec.pos()))) {
        return Err(mismatch(chrom, window.index(),
            format!("record at position {} lies outside of the window {}", rec.pos(), span)));
    }
    Ok(())
}

/// Positions of the records with genetic coordinates within the span.
fn positions_in<'a>(map: &'a GeneticMap, records: &'a [Record], span: Span) -> impl Iterator<Item = u32> + 'a {
    records.iter().map(|rec| rec.pos()).filter(move |&pos| span.contains(map.coord(pos)))
}

/// Adjacent results must contain exactly the same positions in their shared region.
fn check_overlap(chrom: &str, map: &GeneticMap, prev: &ChunkResult, next: &ChunkResult) -> Result<(), Error> {
    let Some(shared) = prev.window().right_overlap() else { return Ok(()) };
    let mut a = positions_in(map, prev.records(), shared);
    let mut b = positions_in(map, next.records(), shared);
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ok(()),
            (Some(x), Some(y)) if x == y => {}
            (x, y) => {
                // The window with the smaller next position has an extra record: the other one lacks it.
                let (lacking, pos) = match (x, y) {
                    (Some(x), Some(y)) if x < y => (next.index(), x),
                    (Some(x), None) => (next.index(), x),
                    (_, Some(y)) => (prev.index(), y),
                    (None, None) => unreachable!(),
                };
                return Err(mismatch(chrom, lacking,
                    format!("position {} in the overlap {} is missing from this window", pos, shared)));
            }
        }
    }
}

/// Merges chunk results of one chromosome.
///
/// Every window must have a result (`IncompleteChromosome` otherwise).
/// If there are several results for the same window, the one from the latest attempt is used.
/// Adjacent results must agree on their overlap (`OverlapMismatch` otherwise),
/// which is then cut at a single coordinate, defined by the tie-break rule.
pub fn merge(
    chrom: &Chromosome,
    windows: &[Window],
    results: impl IntoIterator<Item = Arc<ChunkResult>>,
    tie_break: TieBreak,
) -> Result<MergedOutput, Error> {
    let name = chrom.name();
    let map = chrom.map();
    check_tiling(name, chrom.extent(), windows)?;

    let mut by_index: BTreeMap<usize, Arc<ChunkResult>> = BTreeMap::new();
    for result in results {
        if result.index() >= windows.len() {
            return Err(mismatch(name, result.index(),
                format!("result has no corresponding window ({} windows in total)", windows.len())));
        }
        match by_index.get(&result.index()) {
            Some(prev) if prev.attempt() >= result.attempt() => {}
            _ => { by_index.insert(result.index(), result); }
        }
    }
    let missing: Vec<usize> = (0..windows.len()).filter(|i| !by_index.contains_key(i)).collect();
    if !missing.is_empty() {
        return Err(Error::IncompleteChromosome { chrom: name.to_owned(), missing });
    }
    let results: Vec<Arc<ChunkResult>> = by_index.into_values().collect();
    for (window, result) in windows.iter().zip(&results) {
        check_result(name, map, window, result)?;
    }
    for pair in results.windows(2) {
        check_overlap(name, map, &pair[0], &pair[1])?;
    }

    let extent = chrom.extent();
    let mut records = Vec::new();
    let mut contributions = Vec::with_capacity(results.len());
    let mut lower = extent.start;
    for (i, result) in results.iter().enumerate() {
        let upper = match windows[i].right_overlap() {
            Some(overlap) => tie_break.cut(overlap),
            None => extent.end,
        };
        let recs = result.records();
        let start = recs.partition_point(|rec| map.coord(rec.pos()) < lower);
        let end = start + recs[start..].partition_point(|rec| map.coord(rec.pos()) < upper);
        contributions.push(end - start);
        records.extend_from_slice(&recs[start..end]);
        lower = upper;
    }
    log::debug!("{}: ligated {} records from {} windows", name, records.len(), results.len());
    Ok(MergedOutput {
        chrom: name.to_owned(),
        span: extent,
        records,
        contributions,
    })
}
