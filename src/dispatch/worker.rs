//! Worker boundary: the opaque per-chunk algorithm.

use std::{
    fmt,
    fs,
    io::{BufRead, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use crate::{
    Error,
    err::{add_path, error, validate_param},
    ext::{
        self,
        ser::{json_get, JsonSer},
    },
    genome::Record,
    plan::Chunk,
};
use super::CancelToken;

/// Per-chunk algorithm to be run by the workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Software {
    Eagle,
    Shapeit,
}

impl FromStr for Software {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase() as &str {
            "eagle" => Ok(Self::Eagle),
            "shapeit" | "shapeit4" => Ok(Self::Shapeit),
            _ => Err(format!("Unknown software {:?} (possible values: eagle, shapeit)", s)),
        }
    }
}

impl fmt::Display for Software {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Eagle => "eagle",
            Self::Shapeit => "shapeit",
        })
    }
}

/// Reference genome build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenomeBuild {
    GRCh37,
    GRCh38,
}

impl FromStr for GenomeBuild {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase() as &str {
            "grch37" | "hg19" => Ok(Self::GRCh37),
            "grch38" | "hg38" => Ok(Self::GRCh38),
            _ => Err(format!("Unknown genome build {:?} (possible values: GRCh37, GRCh38)", s)),
        }
    }
}

impl fmt::Display for GenomeBuild {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::GRCh37 => "GRCh37",
            Self::GRCh38 => "GRCh38",
        })
    }
}

/// Algorithm configuration, passed unchanged to every worker invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct AlgoConfig {
    pub software: Software,
    pub build: GenomeBuild,
    /// Optional reference panel.
    pub reference: Option<PathBuf>,
    /// Threads per worker invocation.
    pub threads: u16,
}

impl Default for AlgoConfig {
    fn default() -> Self {
        Self {
            software: Software::Eagle,
            build: GenomeBuild::GRCh38,
            reference: None,
            threads: 1,
        }
    }
}

impl AlgoConfig {
    pub fn validate(&self) -> Result<(), Error> {
        validate_param!(self.threads > 0, "Number of worker threads must be positive");
        if let Some(reference) = &self.reference {
            validate_param!(reference.exists(), "Reference panel {} does not exist", ext::fmt::path(reference));
        }
        Ok(())
    }
}

impl JsonSer for AlgoConfig {
    fn save(&self) -> json::JsonValue {
        json::object!{
            software: self.software.to_string(),
            build: self.build.to_string(),
            reference: self.reference.as_ref().map(|p| p.to_string_lossy().into_owned()),
            threads: self.threads,
        }
    }

    fn load(obj: &json::JsonValue) -> Result<Self, Error> {
        json_get!(obj -> threads (as_u16));
        Ok(Self {
            software: ext::ser::parse_str(obj, "software")?,
            build: ext::ser::parse_str(obj, "build")?,
            reference: obj["reference"].as_str().map(PathBuf::from),
            threads,
        })
    }
}

/// Everything the worker knows about the current attempt.
#[derive(Clone)]
pub struct WorkerContext {
    /// Attempt number, starting with 1.
    pub attempt: u32,
    /// Attempt-scoped working directory, created before the worker starts.
    pub work_dir: PathBuf,
    pub algo: Arc<AlgoConfig>,
    /// Set when the attempt should stop as soon as possible.
    pub cancel: CancelToken,
}

/// Processes one chunk and returns resulting records, sorted by position.
/// `Error::JobPreempted` marks a preempted attempt, `Error::Cancelled` an aborted one,
/// all other errors are treated as attempt failures.
pub trait Worker: Send + Sync {
    fn run(&self, chunk: &Chunk, ctx: &WorkerContext) -> Result<Vec<Record>, Error>;
}

impl<F> Worker for F
where F: Fn(&Chunk, &WorkerContext) -> Result<Vec<Record>, Error> + Send + Sync,
{
    fn run(&self, chunk: &Chunk, ctx: &WorkerContext) -> Result<Vec<Record>, Error> {
        self(chunk, ctx)
    }
}

const INPUT_NAME: &str = "input.tsv";
const OUTPUT_NAME: &str = "output.tsv";
/// Exit codes, that correspond to SIGKILL and SIGTERM.
const PREEMPT_CODES: [i32; 2] = [137, 143];
const WAIT_STEP: Duration = Duration::from_millis(20);

/// Runs external executable on each chunk.
///
/// The chunk is written to `<workdir>/input.tsv`, the executable must write `<workdir>/output.tsv`.
/// Arguments may contain placeholders `{input}`, `{output}`, `{region}`, `{chrom}`, `{threads}`,
/// `{build}` and `{reference}`.
pub struct CommandWorker {
    exe: PathBuf,
    args: Vec<String>,
}

impl CommandWorker {
    /// Creates new worker, executable is searched in `PATH` if needed.
    pub fn new(exe: impl AsRef<Path>, args: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, Error> {
        Ok(Self {
            exe: ext::sys::find_exe(exe)?,
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    fn substitute(&self, chunk: &Chunk, ctx: &WorkerContext, input: &Path, output: &Path)
        -> Result<Vec<String>, Error>
    {
        let reference = ctx.algo.reference.as_ref().map(|p| p.to_string_lossy());
        self.args.iter().map(|arg| {
            if arg.contains("{reference}") && reference.is_none() {
                return Err(error!(InvalidConfig, "Argument {:?} requires a reference panel", arg));
            }
            Ok(arg
                .replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
                .replace("{region}", chunk.region())
                .replace("{chrom}", chunk.window().chrom())
                .replace("{threads}", &ctx.algo.threads.to_string())
                .replace("{build}", &ctx.algo.build.to_string())
                .replace("{reference}", reference.as_deref().unwrap_or("")))
        }).collect()
    }

    fn wait(&self, child: &mut ext::sys::ChildGuard, cancel: &CancelToken) -> Result<ExitStatus, Error> {
        loop {
            if let Some(status) = child.try_wait().map_err(add_path!(self.exe))? {
                return Ok(status);
            }
            if cancel.is_cancelled() {
                child.kill().map_err(add_path!(self.exe))?;
                return Err(Error::Cancelled(format!("{} interrupted", ext::fmt::path(&self.exe))));
            }
            std::thread::sleep(WAIT_STEP);
        }
    }
}

/// Last lines of the file, for error messages.
fn tail(filename: &Path, n: usize) -> String {
    let Ok(contents) = fs::read_to_string(filename) else { return String::new() };
    let lines: Vec<_> = contents.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Reads `pos<TAB>data` records.
pub fn read_records(filename: &Path) -> Result<Vec<Record>, Error> {
    let mut records = Vec::new();
    for (i, line) in ext::sys::open(filename).map_err(add_path!(filename))?.lines().enumerate() {
        let line = line.map_err(add_path!(filename))?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        records.push(Record::parse(&line)
            .map_err(|e| error!(ParsingError, "{}:{}: {}", ext::fmt::path(filename), i + 1, e))?);
    }
    Ok(records)
}

impl Worker for CommandWorker {
    fn run(&self, chunk: &Chunk, ctx: &WorkerContext) -> Result<Vec<Record>, Error> {
        ext::sys::mkdir(&ctx.work_dir).map_err(add_path!(ctx.work_dir))?;
        let input = ctx.work_dir.join(INPUT_NAME);
        let output = ctx.work_dir.join(OUTPUT_NAME);
        let mut writer = ext::sys::create_uncompressed(&input).map_err(add_path!(input))?;
        chunk.write_records(&mut writer).map_err(add_path!(input))?;
        writer.flush().map_err(add_path!(input))?;
        std::mem::drop(writer);

        let stdout_path = ctx.work_dir.join("stdout.log");
        let stderr_path = ctx.work_dir.join("stderr.log");
        let mut command = Command::new(&self.exe);
        command.args(self.substitute(chunk, ctx, &input, &output)?)
            .current_dir(&ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(fs::File::create(&stdout_path).map_err(add_path!(stdout_path))?)
            .stderr(fs::File::create(&stderr_path).map_err(add_path!(stderr_path))?);
        log::debug!("    {}", ext::fmt::command(&command));
        let mut child = ext::sys::ChildGuard::new(command.spawn().map_err(add_path!(self.exe))?);
        let status = self.wait(&mut child, &ctx.cancel)?;

        match status.code() {
            Some(0) => read_records(&output),
            Some(code) if PREEMPT_CODES.contains(&code) =>
                Err(Error::JobPreempted(format!("{} exited with code {}", chunk.window(), code))),
            // Terminated by a signal.
            None => Err(Error::JobPreempted(format!("{} terminated by signal", chunk.window()))),
            Some(code) => Err(Error::JobFailed(format!("{} exited with code {}: {}",
                ext::fmt::path(&self.exe), code, tail(&stderr_path, 5)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_enums() {
        assert_eq!("SHAPEIT".parse::<Software>(), Ok(Software::Shapeit));
        assert_eq!("hg19".parse::<GenomeBuild>(), Ok(GenomeBuild::GRCh37));
        assert!("beagle".parse::<Software>().is_err());
    }

    #[test]
    fn algo_json() {
        let algo = AlgoConfig {
            software: Software::Shapeit,
            build: GenomeBuild::GRCh37,
            reference: Some(PathBuf::from("/data/panel.bcf")),
            threads: 8,
        };
        assert_eq!(AlgoConfig::load(&algo.save()).unwrap(), algo);
        let default = AlgoConfig::default();
        assert_eq!(AlgoConfig::load(&default.save()).unwrap(), default);
    }

    #[test]
    fn closure_worker() {
        let worker = |chunk: &Chunk, _ctx: &WorkerContext| Ok::<_, Error>(chunk.records().to_vec());
        fn assert_worker(_: &impl Worker) {}
        assert_worker(&worker);
    }
}
