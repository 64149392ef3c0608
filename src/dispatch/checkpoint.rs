//! Stores succeeded chunk results on disk, so that an interrupted run can be resumed.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use crate::{
    Error,
    err::{add_path, error},
    ext::{
        self,
        ser::{json_get, JsonSer},
    },
    plan::{Window, Chunk, ChunkData},
};
use super::{
    job::ChunkResult,
    worker::read_records,
};

/// Checkpoint directory: `<dir>/<chrom>/window_<index>.{tsv.gz,json}`.
/// JSON description is written last and marks a complete checkpoint.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    dir: PathBuf,
}

impl Checkpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chrom_dir(&self, chrom: &str) -> PathBuf {
        self.dir.join(chrom)
    }

    fn paths(&self, window: &Window) -> (PathBuf, PathBuf) {
        let dir = self.chrom_dir(window.chrom());
        let stem = format!("window_{:04}", window.index());
        (dir.join(format!("{}.tsv.gz", stem)), dir.join(format!("{}.json", stem)))
    }

    /// Writes the result into the checkpoint directory, replacing previous checkpoint for the same window.
    /// The digest of the chunk is stored as well, and must match on restore.
    pub fn store(&self, chunk: &Chunk, result: &ChunkResult) -> Result<(), Error> {
        let window = result.window();
        if window != chunk.window() {
            return Err(error!(RuntimeError, "Result for {} does not match chunk {}", window, chunk.window()));
        }
        let (records_path, json_path) = self.paths(window);
        let dir = self.chrom_dir(window.chrom());
        ext::sys::mkdir(&dir).map_err(add_path!(dir))?;
        if json_path.exists() {
            fs::remove_file(&json_path).map_err(add_path!(json_path))?;
        }

        let tmp_path = ext::sys::append_path(&records_path, ".tmp");
        let mut writer = ext::sys::create_gzip(&tmp_path).map_err(add_path!(tmp_path))?;
        for rec in result.records() {
            writeln!(writer, "{}", rec).map_err(add_path!(tmp_path))?;
        }
        ext::sys::finish_gzip(writer).map_err(add_path!(tmp_path))?;
        fs::rename(&tmp_path, &records_path).map_err(add_path!(tmp_path, records_path))?;

        let obj = json::object!{
            window: window.save(),
            digest: format!("{:016x}", chunk.digest()),
            attempt: result.attempt(),
            empty: result.data().is_empty(),
            records: result.records().len(),
        };
        ext::sys::save_json(&obj, &json_path)
    }

    fn try_restore(&self, chunk: &Chunk) -> Result<Option<ChunkResult>, Error> {
        let window = chunk.window();
        let (records_path, json_path) = self.paths(window);
        if !json_path.exists() {
            return Ok(None);
        }
        let obj = ext::sys::load_json(&json_path)?;
        json_get!(obj -> digest (as_str), attempt (as_u32), empty (as_bool), records (as_usize));
        let stored = Window::load(&obj["window"])?;
        if &stored != window {
            log::warn!("Ignoring checkpoint {}: stored window {:?} does not match {:?}",
                ext::fmt::path(&json_path), stored, window);
            return Ok(None);
        }
        let expected = format!("{:016x}", chunk.digest());
        if digest != expected {
            log::warn!("Ignoring checkpoint {}: input records of {} have changed", ext::fmt::path(&json_path), window);
            return Ok(None);
        }
        let data = if empty {
            ChunkData::Empty
        } else {
            let recs = read_records(&records_path)?;
            if recs.len() != records {
                return Err(error!(InvalidData, "Checkpoint {} contains {} records, expected {}",
                    ext::fmt::path(&records_path), recs.len(), records));
            }
            ChunkData::Records(recs)
        };
        Ok(Some(ChunkResult::from_data(window.clone(), attempt, data)))
    }

    /// Loads stored result for the chunk, if present and produced from the same window and records.
    /// Unreadable checkpoints are ignored with a warning.
    pub fn restore(&self, chunk: &Chunk) -> Option<ChunkResult> {
        match self.try_restore(chunk) {
            Ok(res) => res,
            Err(e) => {
                log::warn!("Ignoring checkpoint for {}: {}", chunk.window(), e.display());
                None
            }
        }
    }

    /// Indices of all complete checkpoints for the chromosome.
    pub fn stored_indices(&self, chrom: &str) -> Result<Vec<usize>, Error> {
        let pattern = self.chrom_dir(chrom).join("window_*.json");
        let pattern = pattern.to_str()
            .ok_or_else(|| error!(InvalidInput, "Checkpoint path {} is not UTF-8", ext::fmt::path(&pattern)))?;
        let paths = glob::glob(pattern).map_err(|e| error!(RuntimeError, "Invalid glob pattern: {}", e))?;
        let mut indices = Vec::new();
        for path in paths {
            let path = path.map_err(|e| Error::Io(e.into_error(), Vec::new()))?;
            let index = path.file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix("window_"))
                .and_then(|s| s.parse().ok());
            if let Some(index) = index {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Removes all checkpoints of the chromosome.
    pub fn clear(&self, chrom: &str) -> Result<(), Error> {
        let dir = self.chrom_dir(chrom);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(add_path!(dir))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::{
        genome::{Chromosome, GeneticMap, Record, Span},
        plan::{self, EmptyPolicy},
    };

    fn chromosome(payload: impl Fn(u32) -> String) -> Chromosome {
        let records: Vec<_> = (0..45).map(|p| Record::new(p, payload(p))).collect();
        Chromosome::new("chr2", records, Arc::new(GeneticMap::uniform())).unwrap()
            .with_extent(Span::new(0, 45)).unwrap()
    }

    fn chunks(chrom: &Chromosome, chunk_size: u64) -> Vec<Chunk> {
        let windows = plan::plan(chrom.name(), chrom.extent(), chunk_size, 5).unwrap();
        plan::extract_all(chrom, &windows, EmptyPolicy::Fail).unwrap()
    }

    fn haplotypes(p: u32) -> String {
        format!("{}|0", p % 2)
    }

    #[test]
    fn store_restore() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path());
        let chunks = chunks(&chromosome(haplotypes), 20);
        let records = vec![Record::new(16, "0|1"), Record::new(18, "1|1")];
        let result = ChunkResult::new(chunks[1].window().clone(), 2, records);
        checkpoint.store(&chunks[1], &result).unwrap();
        checkpoint.store(&chunks[2], &ChunkResult::empty(chunks[2].window().clone())).unwrap();
        assert!(checkpoint.store(&chunks[0], &result).is_err());

        assert_eq!(checkpoint.stored_indices("chr2").unwrap(), vec![1, 2]);
        assert_eq!(checkpoint.restore(&chunks[1]), Some(result));
        assert!(checkpoint.restore(&chunks[2]).unwrap().data().is_empty());
        assert_eq!(checkpoint.restore(&chunks[0]), None);

        // Different windowing: checkpoint is ignored.
        let other = self::chunks(&chromosome(haplotypes), 25);
        assert_eq!(checkpoint.restore(&other[1]), None);

        checkpoint.clear("chr2").unwrap();
        assert!(checkpoint.stored_indices("chr2").unwrap().is_empty());
    }

    #[test]
    fn changed_input_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path());
        let chunks = chunks(&chromosome(haplotypes), 20);
        let result = ChunkResult::new(chunks[1].window().clone(), 1, vec![Record::new(16, "0|1")]);
        checkpoint.store(&chunks[1], &result).unwrap();
        assert_eq!(checkpoint.restore(&chunks[1]), Some(result));

        let changed = self::chunks(&chromosome(|p| if p == 17 { "1|1".to_owned() } else { haplotypes(p) }), 20);
        assert_eq!(changed[1].window(), chunks[1].window());
        assert_eq!(checkpoint.restore(&changed[1]), None);
    }

    #[test]
    fn corrupted_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path());
        let chunks = chunks(&chromosome(haplotypes), 20);
        let result = ChunkResult::new(chunks[0].window().clone(), 1, vec![Record::new(3, "0|0")]);
        checkpoint.store(&chunks[0], &result).unwrap();
        fs::write(dir.path().join("chr2").join("window_0000.json"), "{ not json").unwrap();
        assert_eq!(checkpoint.restore(&chunks[0]), None);
    }
}
