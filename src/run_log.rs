use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, ErrorKind, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crate::common::file_timestamp;

/// Plain-text run log, one entry per line, flushed as each line is written.
pub struct RunLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RunLog {
    /// Opens a new `<dir>/<timestamp>_log.log`.
    pub fn create(dir: &Path, header: Option<&str>) -> Result<Self> {
        let (path, file) = create_unique(dir, "log.log")?;
        let mut log = Self {
            path,
            writer: BufWriter::new(file),
        };
        if let Some(header) = header {
            log.line(header)?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, text: &str) -> Result<()> {
        writeln!(self.writer, "{text}")
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("Failed writing log file {}", self.path.display()))
    }
}

/// CSV run log whose header comes from `T`'s field names.
pub struct RowLog<T> {
    path: PathBuf,
    writer: Writer<File>,
    rows: usize,
    _row: PhantomData<T>,
}

impl<T: Serialize> RowLog<T> {
    /// Opens a new `<dir>/<timestamp>_<stem>.csv`.
    pub fn create(dir: &Path, stem: &str) -> Result<Self> {
        let (path, file) = create_unique(dir, &format!("{stem}.csv"))?;
        let writer = Writer::from_writer(file);
        Ok(Self {
            path,
            writer,
            rows: 0,
            _row: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write(&mut self, row: &T) -> Result<()> {
        self.writer
            .serialize(row)
            .context("Failed writing row log record")?;
        self.writer
            .flush()
            .with_context(|| format!("Failed flushing row log {}", self.path.display()))?;
        self.rows += 1;
        Ok(())
    }
}

/// Creates `<dir>/<timestamp>_<suffix>`, never reusing an existing file. Runs
/// started within the same second get `<timestamp>-<n>_<suffix>`.
fn create_unique(dir: &Path, suffix: &str) -> Result<(PathBuf, File)> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed creating log directory {}", dir.display()))?;
    let stamp = file_timestamp();
    for n in 0..1000u32 {
        let name = if n == 0 {
            format!("{stamp}_{suffix}")
        } else {
            format!("{stamp}-{n}_{suffix}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed creating log file {}", path.display()));
            }
        }
    }
    anyhow::bail!(
        "Failed creating log file in {}: too many logs named {stamp}_{suffix}",
        dir.display()
    )
}
