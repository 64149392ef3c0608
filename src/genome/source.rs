//! Read-only, position-ordered sources of genotype records.

use std::{
    io::BufRead,
    path::{Path, PathBuf},
    sync::Arc,
    collections::HashMap,
};
use crate::{
    Error,
    err::{error, add_path},
    ext,
};
use super::{Record, Chromosome, GeneticMap};

/// Source of chromosomes.
pub trait Source: Send + Sync {
    /// Names of all chromosomes in the source, in the order of appearance.
    fn chromosomes(&self) -> Result<Vec<String>, Error>;

    /// Loads all records for a single chromosome.
    fn load(&self, chrom: &str) -> Result<Chromosome, Error>;
}

/// Source over chromosomes, already loaded into memory.
pub struct MemorySource(Vec<Chromosome>);

impl MemorySource {
    pub fn new(chromosomes: Vec<Chromosome>) -> Self {
        Self(chromosomes)
    }
}

impl Source for MemorySource {
    fn chromosomes(&self) -> Result<Vec<String>, Error> {
        Ok(self.0.iter().map(|chrom| chrom.name().to_owned()).collect())
    }

    fn load(&self, chrom: &str) -> Result<Chromosome, Error> {
        self.0.iter().find(|c| c.name() == chrom).cloned()
            .ok_or_else(|| error!(InvalidInput, "Chromosome {} is not present in the input", chrom))
    }
}

/// Plain or gzip-compressed text file with `chrom<TAB>pos<TAB>data` lines.
/// Lines starting with `#` are skipped. Records of one chromosome must be consecutive and sorted.
pub struct TsvSource {
    filename: PathBuf,
    maps: HashMap<String, Arc<GeneticMap>>,
}

impl TsvSource {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            maps: HashMap::new(),
        }
    }

    /// Uses this genetic map for the chromosome. Chromosomes without a map use uniform 1 cM/Mb rate.
    pub fn set_map(&mut self, chrom: impl Into<String>, map: GeneticMap) {
        self.maps.insert(chrom.into(), Arc::new(map));
    }

    /// Loads genetic maps for all chromosomes from a single map file.
    pub fn load_maps(&mut self, map_filename: &Path) -> Result<(), Error> {
        for chrom in self.chromosomes()? {
            let map = GeneticMap::load(map_filename, &chrom)?;
            self.set_map(chrom, map);
        }
        Ok(())
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Calls `f(chrom, rest_of_line)` for every non-comment line.
    fn for_each_line(&self, mut f: impl FnMut(usize, &str, &str) -> Result<(), Error>) -> Result<(), Error> {
        let reader = ext::sys::open(&self.filename).map_err(add_path!(self.filename))?;
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(add_path!(self.filename))?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (chrom, rest) = line.split_once('\t').ok_or_else(|| error!(ParsingError,
                "{}:{}: expected at least two tab-separated columns", ext::fmt::path(&self.filename), line_num + 1))?;
            f(line_num, chrom, rest)?;
        }
        Ok(())
    }
}

impl Source for TsvSource {
    fn chromosomes(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = Vec::new();
        self.for_each_line(|line_num, chrom, _| {
            if names.last().map(String::as_str) != Some(chrom) {
                if names.iter().any(|name| name == chrom) {
                    return Err(error!(InvalidData, "{}:{}: records for {} are not consecutive",
                        ext::fmt::path(&self.filename), line_num + 1, chrom));
                }
                names.push(chrom.to_owned());
            }
            Ok(())
        })?;
        Ok(names)
    }

    fn load(&self, chrom: &str) -> Result<Chromosome, Error> {
        let mut records = Vec::new();
        self.for_each_line(|line_num, curr_chrom, rest| {
            if curr_chrom == chrom {
                records.push(Record::parse(rest).map_err(|e| error!(ParsingError, "{}:{}: {}",
                    ext::fmt::path(&self.filename), line_num + 1, e))?);
            }
            Ok(())
        })?;
        log::debug!("Loaded {} records for {} from {}", records.len(), chrom, ext::fmt::path(&self.filename));
        let map = self.maps.get(chrom).cloned().unwrap_or_else(|| Arc::new(GeneticMap::uniform()));
        Chromosome::new(chrom, records, map)
    }
}
