use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use common::Result;

/// Which output stream of a worker a log file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Every record the worker's filter lets through.
    Out,
    /// Warnings and errors only.
    Err,
}

impl StreamKind {
    fn extension(self) -> &'static str {
        match self {
            StreamKind::Out => "out",
            StreamKind::Err => "err",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
}

/// Maps a worker group to its log files: `{dir}/{name}-group-{id}.{out,err}`.
#[derive(Debug, Clone)]
pub struct LogRouter {
    dir: PathBuf,
    name: String,
}

impl LogRouter {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, group: usize, kind: StreamKind) -> PathBuf {
        self.dir
            .join(format!("{}-group-{group}.{}", self.name, kind.extension()))
    }

    pub fn paths(&self, group: usize) -> LogPaths {
        LogPaths {
            out: self.path(group, StreamKind::Out),
            err: self.path(group, StreamKind::Err),
        }
    }

    /// Create the log directory and move the previous run's files aside.
    /// Called once per group at startup; restarts append to the same files.
    pub fn prepare(&self, group: usize) -> Result<LogPaths> {
        fs::create_dir_all(&self.dir)?;
        let paths = self.paths(group);
        for path in [&paths.out, &paths.err] {
            if let Some(rotated) = rotate(path)? {
                info!(from = %path.display(), to = %rotated.display(), "Rotated log file");
            }
        }
        Ok(paths)
    }
}

/// Rename an existing `path` to the first free `path.N` (N from 1).
pub fn rotate(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut n = 1u32;
    loop {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(format!(".{n}"));
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            fs::rename(path, &candidate)?;
            return Ok(Some(candidate));
        }
        n += 1;
    }
}
