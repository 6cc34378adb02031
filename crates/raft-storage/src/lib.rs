//! # raft-storage
//!
//! why: write each server's applied commands to an output log file on disk
//! relations: implements raft-core's ApplySink, used by raft-cluster when spawning servers
//! what: FileSink with degraded mode, output log reader, conventional log and command file paths

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raft_core::{ApplySink, LogEntry, LogIndex, Rank};
use tracing::{debug, warn};

/// Output log of server `rank` inside `dir`.
pub fn server_log_path(dir: impl AsRef<Path>, rank: Rank) -> PathBuf {
    dir.as_ref().join(format!("logs_server_{rank}.txt"))
}

/// Seed command file of client `rank` inside `dir`.
pub fn client_commands_path(dir: impl AsRef<Path>, rank: Rank) -> PathBuf {
    dir.as_ref().join(format!("commands_client_{rank}.txt"))
}

/// File-backed output log, one line per applied command.
///
/// The file is truncated on creation. If it cannot be opened the sink runs
/// degraded: appends retry opening it and report the failure to the caller,
/// which logs it and keeps applying in memory.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    /// Create (or truncate) the output log, creating parent directories.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        debug!(path = %path.display(), "output log created");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Like [`FileSink::create`], but a failure leaves the sink degraded instead of erroring.
    pub fn create_or_degraded(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::create(path.clone()) {
            Ok(sink) => sink,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unable to open output log, running degraded");
                Self { path, file: None }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_degraded(&self) -> bool {
        self.file.is_none()
    }

    fn open_for_append(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }
}

impl ApplySink for FileSink {
    fn append(&mut self, index: LogIndex, entry: &LogEntry) -> raft_core::Result<()> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => self.open_for_append()?,
        };
        writeln!(file, "{}", entry.command)?;
        file.flush()?;
        self.file = Some(file);
        debug!(path = %self.path.display(), index, "applied entry written");
        Ok(())
    }
}

/// Lines of an output log, in apply order.
pub fn read_output_log(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(contents.lines().map(str::to_string).collect())
}
