//! Run parameters, saved between executions.

use std::{
    fmt,
    path::Path,
    str::FromStr,
};
use crate::{
    Error,
    err::validate_param,
    ext::{
        self,
        ser::{json_get, JsonSer},
    },
    dispatch::{AlgoConfig, DispatchParams},
    ligate::TieBreak,
    plan::{EmptyPolicy, WindowParams},
};

/// Which parts of a previous run need to be recomputed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rerun {
    /// Ignore checkpoints and previous outputs, recompute everything.
    All,
    /// Reuse checkpointed windows, but recompute all chromosomes.
    Part,
    /// Do not recompute finished chromosomes, reuse checkpointed windows for the rest.
    None,
}

impl Rerun {
    /// Returns true if the chromosome needs to be processed.
    pub fn need_analysis(self, done: bool) -> bool {
        !done || self != Rerun::None
    }

    /// Returns true if stored window checkpoints can be used.
    pub fn use_checkpoints(self) -> bool {
        self != Rerun::All
    }
}

impl FromStr for Rerun {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase() as &str {
            "all" => Ok(Self::All),
            "part" => Ok(Self::Part),
            "none" => Ok(Self::None),
            _ => Err(format!("Unknown rerun mode {:?} (possible values: all, part, none)", s)),
        }
    }
}

impl fmt::Display for Rerun {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Part => "part",
            Self::None => "none",
        })
    }
}

/// All parameters of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct Params {
    pub windows: WindowParams,
    pub empty_policy: EmptyPolicy,
    pub dispatch: DispatchParams,
    pub tie_break: TieBreak,
    pub algo: AlgoConfig,
    /// Number of chromosomes, processed simultaneously.
    pub chrom_threads: usize,
    pub rerun: Rerun,
    /// Seed for the retry backoff.
    pub seed: Option<u64>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            windows: WindowParams::default(),
            empty_policy: EmptyPolicy::Fail,
            dispatch: DispatchParams::default(),
            tie_break: TieBreak::default(),
            algo: AlgoConfig::default(),
            chrom_threads: 4,
            rerun: Rerun::None,
            seed: None,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), Error> {
        self.windows.validate()?;
        self.dispatch.validate()?;
        self.algo.validate()?;
        validate_param!(self.chrom_threads > 0, "Number of chromosome threads must be positive");
        Ok(())
    }

    /// Compares with the parameters of the previous run.
    /// Returns true if previous results cannot be reused, or the old parameters cannot be loaded.
    pub fn need_rerun(&self, path: &Path) -> bool {
        if !path.exists() {
            log::error!("Cannot find old parameters at {}", ext::fmt::path(path));
            return true;
        }
        let old = match ext::sys::load_json(path).and_then(|obj| Params::load(&obj)) {
            Err(e) => {
                log::error!("Cannot load old parameters from {}: {}", ext::fmt::path(path), e.display());
                return true;
            }
            Ok(val) => val,
        };
        if self.windows != old.windows {
            log::error!("Window sizes have changed ({} cM / {} cM -> {} cM / {} cM)",
                old.windows.chunk_size_cm, old.windows.overlap_cm, self.windows.chunk_size_cm, self.windows.overlap_cm);
            true
        } else if self.empty_policy != old.empty_policy {
            log::error!("Empty window policy has changed ({} -> {})", old.empty_policy, self.empty_policy);
            true
        } else if self.algo != old.algo {
            log::error!("Algorithm configuration has changed ({:?} -> {:?})", old.algo, self.algo);
            true
        } else if self.tie_break != old.tie_break {
            log::error!("Ligation rule has changed ({} -> {})", old.tie_break, self.tie_break);
            true
        } else {
            // Not critical.
            if self.dispatch != old.dispatch {
                log::warn!("Dispatch parameters have changed");
            }
            false
        }
    }
}

impl JsonSer for Params {
    fn save(&self) -> json::JsonValue {
        json::object!{
            windows: self.windows.save(),
            empty_policy: self.empty_policy.to_string(),
            dispatch: self.dispatch.save(),
            tie_break: self.tie_break.to_string(),
            algo: self.algo.save(),
            chrom_threads: self.chrom_threads,
            seed: self.seed,
        }
    }

    fn load(obj: &json::JsonValue) -> Result<Self, Error> {
        json_get!(obj -> chrom_threads (as_usize));
        Ok(Self {
            windows: WindowParams::load(&obj["windows"])?,
            empty_policy: ext::ser::parse_str(obj, "empty_policy")?,
            dispatch: DispatchParams::load(&obj["dispatch"])?,
            tie_break: ext::ser::parse_str(obj, "tie_break")?,
            algo: AlgoConfig::load(&obj["algo"])?,
            chrom_threads,
            // Rerun mode only affects the current execution.
            rerun: Rerun::None,
            seed: obj["seed"].as_u64(),
        })
    }
}
