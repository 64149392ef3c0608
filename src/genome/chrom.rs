use std::{
    fmt,
    ops::Range,
    sync::Arc,
};
use crate::{
    Error,
    err::error,
};
use super::{Record, Span, GeneticMap};

/// Immutable chromosome: position-sorted records together with their genetic coordinates.
#[derive(Clone)]
pub struct Chromosome {
    name: String,
    records: Arc<[Record]>,
    /// Genetic coordinate of each record.
    coords: Arc<[u64]>,
    map: Arc<GeneticMap>,
    /// Genetic extent.
    extent: Span,
}

impl Chromosome {
    /// Creates a chromosome from records, sorted by position.
    /// Extent spans from the first to the last record (inclusive).
    pub fn new(name: impl Into<String>, records: Vec<Record>, map: Arc<GeneticMap>) -> Result<Self, Error> {
        let name = name.into();
        if records.is_empty() {
            return Err(error!(InvalidData, "Chromosome {} contains no records", name));
        }
        for (i, pair) in records.windows(2).enumerate() {
            if pair[0].pos() >= pair[1].pos() {
                return Err(error!(InvalidData,
                    "Records on {} are not sorted or contain duplicates (record #{}: {} followed by {})",
                    name, i + 1, pair[0].pos(), pair[1].pos()));
            }
        }
        let coords: Arc<[u64]> = records.iter().map(|rec| map.coord(rec.pos())).collect();
        let extent = Span::new(coords[0], coords[coords.len() - 1] + 1);
        Ok(Self {
            name,
            records: records.into(),
            coords,
            map,
            extent,
        })
    }

    /// Replaces the extent with an explicit one (for example, covering the whole chromosome length).
    /// The new extent must contain all records.
    pub fn with_extent(mut self, extent: Span) -> Result<Self, Error> {
        if !extent.covers(&self.extent) {
            return Err(error!(InvalidData, "Extent {} of {} does not contain all records {}",
                extent, self.name, self.extent));
        }
        self.extent = extent;
        Ok(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[inline]
    pub fn coords(&self) -> &[u64] {
        &self.coords
    }

    #[inline]
    pub fn map(&self) -> &Arc<GeneticMap> {
        &self.map
    }

    /// Genetic extent of the chromosome.
    #[inline]
    pub fn extent(&self) -> Span {
        self.extent
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Physical positions of the first and the last record.
    pub fn phys_extent(&self) -> (u32, u32) {
        (self.records[0].pos(), self.records[self.records.len() - 1].pos())
    }

    /// Range of record indices with genetic coordinate in `[span.start, span.end)`.
    pub fn range_in(&self, span: &Span) -> Range<usize> {
        let start = self.coords.partition_point(|&c| c < span.start);
        let end = start + self.coords[start..].partition_point(|&c| c < span.end);
        start..end
    }

    /// Region string `name:start-end` (1-based, inclusive physical positions), covering the genetic span.
    pub fn region(&self, span: &Span) -> String {
        let start = self.map.first_pos(span.start).max(1);
        let end = self.map.first_pos(span.end).saturating_sub(1).max(start);
        format!("{}:{}-{}", self.name, start, end)
    }
}

impl fmt::Debug for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Chromosome({}, {} records, extent {})", self.name, self.records.len(), self.extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(positions: &[u32]) -> Vec<Record> {
        positions.iter().map(|&p| Record::new(p, format!("r{}", p))).collect()
    }

    #[test]
    fn construction() {
        let map = Arc::new(GeneticMap::uniform());
        let chrom = Chromosome::new("chr1", records(&[5, 10, 15]), Arc::clone(&map)).unwrap();
        assert_eq!(chrom.extent(), Span::new(5, 16));
        assert_eq!(chrom.phys_extent(), (5, 15));
        assert!(Chromosome::new("chr1", records(&[5, 5]), Arc::clone(&map)).is_err());
        assert!(Chromosome::new("chr1", records(&[6, 5]), Arc::clone(&map)).is_err());
        assert!(Chromosome::new("chr1", Vec::new(), Arc::clone(&map)).is_err());

        let chrom = chrom.with_extent(Span::new(0, 45)).unwrap();
        assert_eq!(chrom.extent(), Span::new(0, 45));
        assert!(chrom.clone().with_extent(Span::new(6, 45)).is_err());
    }

    #[test]
    fn ranges_and_regions() {
        let chrom = Chromosome::new("chr2", records(&[1, 10, 14, 15, 20, 44]), Arc::new(GeneticMap::uniform()))
            .unwrap();
        assert_eq!(chrom.range_in(&Span::new(0, 15)), 0..3);
        assert_eq!(chrom.range_in(&Span::new(15, 35)), 3..5);
        assert_eq!(chrom.range_in(&Span::new(30, 45)), 5..6);
        assert_eq!(chrom.range_in(&Span::new(21, 30)), 5..5);
        assert_eq!(chrom.region(&Span::new(0, 20)), "chr2:1-19");
        assert_eq!(chrom.region(&Span::new(15, 35)), "chr2:15-34");
    }
}
