//! Zip archives of staged directories, handed out as byte chunks.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Datelike, Local, Timelike};
use tempfile::SpooledTempFile;
use thiserror::Error;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

const CHUNK_SIZE: usize = 64 * 1024;
/// Archives up to this size never touch the disk while being streamed.
const SPOOL_LIMIT: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("failed to archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

fn io_error(path: &Path, source: io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A directory tree packed into a zip archive, breadth first.
///
/// Entry names are relative to the root and use `/` separators. Only files
/// get entries; a directory shows up through the files below it, so empty
/// directories are left out. Every entry carries the file's modification time
/// and, on unix, its permission bits.
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files in archive order as `(entry name, path on disk)`.
    pub fn entries(&self) -> ArchiveResult<Vec<(String, PathBuf)>> {
        if !self.root.is_dir() {
            return Err(ArchiveError::NotADirectory {
                path: self.root.clone(),
            });
        }
        let mut entries = Vec::new();
        let mut pending = VecDeque::from([(self.root.clone(), String::new())]);
        while let Some((dir, prefix)) = pending.pop_front() {
            let mut children = fs::read_dir(&dir)
                .and_then(|listing| {
                    listing
                        .map(|entry| entry.map(|entry| entry.path()))
                        .collect::<io::Result<Vec<_>>>()
                })
                .map_err(|source| io_error(&dir, source))?;
            children.sort();
            for path in children {
                let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let entry = format!("{prefix}{name}");
                if path.is_dir() {
                    pending.push_back((path, format!("{entry}/")));
                } else {
                    entries.push((entry, path));
                }
            }
        }
        Ok(entries)
    }

    /// Writes the whole archive into `sink` and returns it finished.
    pub fn write_to<W: Write + Seek>(&self, sink: W) -> ArchiveResult<W> {
        let entries = self.entries()?;
        let mut zip = ZipWriter::new(sink);
        for (name, path) in &entries {
            let metadata = fs::metadata(path).map_err(|source| io_error(path, source))?;
            zip.start_file(name.as_str(), entry_options(&metadata))?;
            let mut file = File::open(path).map_err(|source| io_error(path, source))?;
            io::copy(&mut file, &mut zip).map_err(|source| io_error(path, source))?;
        }
        let sink = zip.finish()?;
        debug!(
            root = %self.root.display(),
            files = entries.len(),
            "archived directory"
        );
        Ok(sink)
    }

    /// The finished archive as a sequence of byte chunks. Large archives are
    /// spooled to a temporary file first.
    pub fn stream(&self) -> ArchiveResult<ArchiveChunks> {
        let mut spool = self.write_to(SpooledTempFile::new(SPOOL_LIMIT))?;
        spool
            .seek(SeekFrom::Start(0))
            .map_err(|source| io_error(&self.root, source))?;
        Ok(ByteChunks::new(spool))
    }
}

fn entry_options(metadata: &fs::Metadata) -> FileOptions {
    let mut options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    if let Ok(modified) = metadata.modified() {
        options = options.last_modified_time(zip_time(modified));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode());
    }
    options
}

/// Zip timestamps cover 1980..=2107 in local time; anything else maps to the
/// format's epoch.
fn zip_time(time: SystemTime) -> DateTime {
    let local = chrono::DateTime::<Local>::from(time);
    u16::try_from(local.year())
        .ok()
        .and_then(|year| {
            DateTime::from_date_and_time(
                year,
                local.month() as u8,
                local.day() as u8,
                local.hour() as u8,
                local.minute() as u8,
                local.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

pub type ArchiveChunks = ByteChunks<SpooledTempFile>;

/// Reads a source to its end in fixed-size chunks. Stops after the first
/// error.
#[derive(Debug)]
pub struct ByteChunks<R> {
    reader: R,
    done: bool,
}

impl<R: Read> ByteChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ByteChunks<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        match (&mut self.reader)
            .take(CHUNK_SIZE as u64)
            .read_to_end(&mut chunk)
        {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => Some(Ok(chunk)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// A single file as byte chunks, for serving files that need no archive.
pub fn file_chunks(path: impl AsRef<Path>) -> io::Result<ByteChunks<File>> {
    File::open(path).map(ByteChunks::new)
}
