//! Destinations for ligated chromosomes.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use crate::{
    Error,
    err::add_path,
    ext,
    ligate::MergedOutput,
};

/// Receives merged output, one chromosome at a time.
pub trait Sink: Send {
    /// Returns true if the chromosome was already written by a previous run.
    fn is_done(&self, _chrom: &str) -> bool {
        false
    }

    fn accept(&mut self, output: MergedOutput) -> Result<(), Error>;
}

/// Keeps all outputs in memory.
#[derive(Default)]
pub struct CollectSink {
    outputs: BTreeMap<String, MergedOutput>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chrom: &str) -> Option<&MergedOutput> {
        self.outputs.get(chrom)
    }

    pub fn outputs(&self) -> &BTreeMap<String, MergedOutput> {
        &self.outputs
    }

    pub fn into_outputs(self) -> BTreeMap<String, MergedOutput> {
        self.outputs
    }
}

impl Sink for CollectSink {
    fn accept(&mut self, output: MergedOutput) -> Result<(), Error> {
        self.outputs.insert(output.chrom().to_owned(), output);
        Ok(())
    }
}

/// Writes `<dir>/<chrom>.ligated.tsv.gz` with `chrom<TAB>pos<TAB>data` lines.
pub struct TsvSink {
    dir: PathBuf,
}

impl TsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        ext::sys::mkdir(&dir).map_err(add_path!(dir))?;
        Ok(Self { dir })
    }

    pub fn path(&self, chrom: &str) -> PathBuf {
        self.dir.join(format!("{}.ligated.tsv.gz", chrom))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Sink for TsvSink {
    fn is_done(&self, chrom: &str) -> bool {
        self.path(chrom).exists()
    }

    fn accept(&mut self, output: MergedOutput) -> Result<(), Error> {
        let filename = self.path(output.chrom());
        let tmp_filename = ext::sys::append_path(&filename, ".tmp");
        let mut writer = ext::sys::create_gzip(&tmp_filename).map_err(add_path!(tmp_filename))?;
        writeln!(writer, "#chrom\tpos\tdata").map_err(add_path!(tmp_filename))?;
        for rec in output.records() {
            writeln!(writer, "{}\t{}", output.chrom(), rec).map_err(add_path!(tmp_filename))?;
        }
        ext::sys::finish_gzip(writer).map_err(add_path!(tmp_filename))?;
        fs::rename(&tmp_filename, &filename).map_err(add_path!(tmp_filename, filename))?;
        log::info!("    Wrote {} records to {}", output.len(), ext::fmt::path(&filename));
        Ok(())
    }
}
