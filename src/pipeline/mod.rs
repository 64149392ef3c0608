//! Pipeline coordinator: plan, extract, dispatch, ligate and write every chromosome.

pub mod params;
pub mod status;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Instant,
};
use colored::Colorize;
use crate::{
    Error,
    err::{add_path, error},
    ext::{self, ser::JsonSer},
    dispatch::{self, Backend, CancelToken, Checkpoint, Dispatcher},
    genome::{
        source::Source,
        sink::Sink,
    },
    ligate::{self, MergedOutput},
    plan,
};
pub use params::{Params, Rerun};
pub use status::{RunStatus, ChromStatus, ChromState, JobStatus};

const PARAMS_NAME: &str = "params.json";
const REGIONS_NAME: &str = "regions.lines";
const CHECKPOINT_DIR: &str = "checkpoints";

/// Coordinates processing of all chromosomes.
pub struct Pipeline {
    params: Params,
    backend: Arc<dyn Backend>,
    work_dir: PathBuf,
    checkpoint: Option<Checkpoint>,
    cancel: CancelToken,
    status: Arc<RunStatus>,
}

impl Pipeline {
    /// Creates new pipeline, validating parameters.
    pub fn new(params: Params, backend: Arc<dyn Backend>, work_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        params.validate()?;
        Ok(Self {
            params, backend,
            work_dir: work_dir.into(),
            checkpoint: None,
            cancel: CancelToken::new(),
            status: Arc::new(RunStatus::new()),
        })
    }

    /// Stores succeeded windows in `<work_dir>/checkpoints`, and reuses them on the next run.
    pub fn enable_checkpoints(mut self) -> Self {
        self.checkpoint = Some(Checkpoint::new(self.work_dir.join(CHECKPOINT_DIR)));
        self
    }

    pub fn set_checkpoint(mut self, checkpoint: Option<Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn set_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Token, that cancels the whole run.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn status(&self) -> &Arc<RunStatus> {
        &self.status
    }

    /// Saves parameters, or checks them against the previous run.
    fn prepare_work_dir(&self) -> Result<(), Error> {
        ext::sys::mkdir(&self.work_dir).map_err(add_path!(self.work_dir))?;
        let params_path = self.work_dir.join(PARAMS_NAME);
        if params_path.exists() && self.params.rerun != Rerun::All && self.params.need_rerun(&params_path) {
            log::error!("Please rerun with {} or use a new working directory", "Rerun::All".red());
            return Err(error!(InvalidConfig, "Parameters differ from the previous run in {}",
                ext::fmt::path(&self.work_dir)));
        }
        ext::sys::save_json(&self.params.save(), &params_path)
    }

    /// Processes all chromosomes from the source and writes them into the sink.
    /// Chromosome failures do not stop other chromosomes,
    /// however, the run fails if at least one chromosome failed.
    pub fn run(&self, source: &dyn Source, sink: &mut dyn Sink) -> Result<(), Error> {
        let timer = Instant::now();
        self.prepare_work_dir()?;
        let chroms = source.chromosomes()?;
        for chrom in chroms.iter() {
            self.status.register(chrom);
        }

        let mut todo = Vec::with_capacity(chroms.len());
        for chrom in chroms.iter() {
            if self.params.rerun.need_analysis(sink.is_done(chrom)) {
                todo.push(chrom.as_str());
            } else {
                log::info!("Skipping {}: already finished", chrom.bold());
                self.status.set_state(chrom, ChromState::Succeeded);
            }
        }
        if let (Some(checkpoint), false) = (&self.checkpoint, self.params.rerun.use_checkpoints()) {
            for chrom in todo.iter() {
                checkpoint.clear(chrom)?;
            }
        }

        let n_threads = self.params.chrom_threads.min(todo.len()).max(1);
        log::info!("Processing {} chromosomes in {} threads", todo.len(), n_threads);
        let next = AtomicUsize::new(0);
        let sink = Mutex::new(sink);
        thread::scope(|scope| {
            for _ in 0..n_threads {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(&chrom) = todo.get(i) else { break };
                    self.status.set_state(chrom, ChromState::InProgress);
                    let state = match self.process_chromosome(chrom, i, source, &sink) {
                        Ok(()) => ChromState::Succeeded,
                        Err(e) => {
                            log::error!("{} failed: {}", chrom.bold(), e.display());
                            ChromState::Failed(e.to_string())
                        }
                    };
                    self.status.set_state(chrom, state);
                });
            }
        });

        let failures = self.status.failures();
        log::info!("Finished in {}\n{}", ext::fmt::Duration(timer.elapsed()), self.status.summary());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(error!(RuntimeError, "{} / {} chromosomes failed: {}", failures.len(), chroms.len(),
                failures.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(", ")))
        }
    }

    /// Runs all stages for a single chromosome.
    fn process_chromosome(
        &self,
        name: &str,
        chrom_ix: usize,
        source: &dyn Source,
        sink: &Mutex<&mut dyn Sink>,
    ) -> Result<(), Error> {
        let timer = Instant::now();
        let chrom = source.load(name)?;
        let windows = self.params.windows.plan(&chrom)?;
        log::info!("{}: {} records, extent {}, {} windows", name.bold(), chrom.len(),
            ext::fmt::Cm(chrom.extent().len()), windows.len());
        let chunks = plan::extract_all(&chrom, &windows, self.params.empty_policy)?;

        let chrom_dir = dispatch::chrom_dir(&self.work_dir, name);
        ext::sys::mkdir(&chrom_dir).map_err(add_path!(chrom_dir))?;
        plan::chunk::write_regions(&chrom_dir.join(REGIONS_NAME), &chunks)?;

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.backend), self.params.dispatch.clone(), &self.work_dir)
            .set_algo(Arc::new(self.params.algo.clone()))
            .set_checkpoint(self.checkpoint.clone())
            .set_cancel_token(self.cancel.clone())
            .set_status(Arc::clone(&self.status))
            .set_seed(self.params.seed.map(|seed| seed.wrapping_add(chrom_ix as u64)));
        let outcomes = dispatcher.run(name, chunks)?;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for (_, outcome) in outcomes.into_iter() {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            // Report the first actual failure, rather than windows, cancelled because of it.
            let i = errors.iter().position(|e| !matches!(e, Error::Cancelled(_))).unwrap_or(0);
            return Err(errors.swap_remove(i));
        }
        let merged: MergedOutput = ligate::merge(&chrom, &windows, results, self.params.tie_break)?;
        log::info!("{}: ligated {} records in {}", name.bold(), merged.len(), ext::fmt::Duration(timer.elapsed()));
        sink.lock().unwrap_or_else(|e| e.into_inner()).accept(merged)
    }
}
