use std::{
    io::{self, Read, BufRead, BufReader, Write, BufWriter, stdin},
    fs::{self, File},
    path::{Path, PathBuf},
    ffi::OsStr,
    process::{Child, ExitStatus},
};
use flate2::{
    bufread::MultiGzDecoder,
    write::GzEncoder,
    Compression,
};
use crate::err::{Error, add_path};

/// Finds an executable, and returns Error, if executable is not available.
pub fn find_exe(p: impl AsRef<Path>) -> Result<PathBuf, Error> {
    which::which(p.as_ref()).map_err(|_| Error::NoExec(p.as_ref().to_owned()))
}

/// Returns
/// - stdin if filename is `-`,
/// - gzip reader if the file starts with gzip magic number,
/// - regular text file otherwise.
pub fn open(filename: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    if filename == OsStr::new("-") || filename == OsStr::new("/dev/stdin") {
        Ok(Box::new(BufReader::new(stdin())))
    } else {
        let mut stream = BufReader::new(File::open(filename)?);
        let mut two_bytes = [0_u8; 2];
        let bytes_read = stream.read(&mut two_bytes)?;
        stream.seek_relative(-(bytes_read as i64))?;
        // Check gzip magic number.
        if bytes_read == 2 && two_bytes[0] == 0x1f && two_bytes[1] == 0x8b {
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(stream))))
        } else {
            Ok(Box::new(stream))
        }
    }
}

/// Creates a buffered uncompressed file.
pub fn create_uncompressed(filename: &Path) -> io::Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(filename)?))
}

/// Creates a gzip file.
pub fn create_gzip(filename: &Path) -> io::Result<BufWriter<GzEncoder<File>>> {
    let file = File::create(filename)?;
    Ok(BufWriter::new(GzEncoder::new(file, Compression::default())))
}

/// Finishes gzip stream and flushes it to the disk.
pub fn finish_gzip(writer: BufWriter<GzEncoder<File>>) -> io::Result<()> {
    writer.into_inner().map_err(|e| e.into_error())?.finish()?.sync_all()
}

/// Create directory (with all parents), if it does not exist yet.
pub fn mkdir(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path)
    } else {
        Ok(())
    }
}

/// Writes the file through a temporary file, that is renamed at the end.
/// This way, partially written files never appear under the final name.
pub fn write_atomic<F>(filename: &Path, fill: F) -> crate::Result<()>
where F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let tmp = append_path(filename, ".tmp");
    {
        let mut writer = create_uncompressed(&tmp).map_err(add_path!(tmp))?;
        fill(&mut writer).map_err(add_path!(tmp))?;
        writer.flush().map_err(add_path!(tmp))?;
    }
    fs::rename(&tmp, filename).map_err(add_path!(tmp, filename))
}

/// Returns a path with a new suffix appended to the end.
pub fn append_path(path: &Path, suffix: impl AsRef<OsStr>) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(suffix.as_ref());
    os_string.into()
}

/// Loads JSON from the file.
pub fn load_json(filename: &Path) -> crate::Result<json::JsonValue> {
    let mut s = String::new();
    open(filename).map_err(add_path!(filename))?
        .read_to_string(&mut s).map_err(add_path!(filename))?;
    Ok(json::parse(&s)?)
}

/// Saves JSON to the file.
pub fn save_json(obj: &json::JsonValue, filename: &Path) -> crate::Result<()> {
    write_atomic(filename, |w| obj.write_pretty(w, 4))
}

/// RAII child wrapper, that kills the child if it gets dropped.
pub struct ChildGuard {
    child: Child,
    armed: bool,
}

impl ChildGuard {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Checks if the child has finished, without blocking.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.disarm();
        }
        Ok(status)
    }

    /// Kills the child and waits for it to exit.
    pub fn kill(&mut self) -> io::Result<()> {
        self.disarm();
        match self.child.kill() {
            // InvalidInput means that the process exited already.
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => return Err(e),
            _ => {}
        }
        self.child.wait().map(|_| ())
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.armed {
            match self.child.kill() {
                Err(e) => {
                    if e.kind() != io::ErrorKind::InvalidInput {
                        log::error!("Could not kill child process: {}", e);
                    }
                }
                Ok(_) => log::error!("Successfully killed child process"),
            }
        }
    }
}

/// Initializes colored stderr logger with the given verbosity.
pub fn init_logger(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    use fern::{
        Dispatch,
        colors::{Color, ColoredLevelConfig},
    };
    let colors = ColoredLevelConfig::default()
        .info(Color::Green)
        .debug(Color::Cyan);
    Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {:>5}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                colors.color(record.level()),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
}
