//! Sorted runs stored on file system.

use std::fmt;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use crate::record::{trim_line_end, LineRecord};
use crate::sort::SortError;

/// Run identity.
///
/// Runs produced by the split phase have `pass` zero, `group` set to the input segment and `seq` to the
/// batch number inside the segment. Intermediate merge results use the merge pass and group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId {
    pub pass: usize,
    pub group: usize,
    pub seq: usize,
}

impl RunId {
    pub fn new(pass: usize, group: usize, seq: usize) -> Self {
        RunId { pass, group, seq }
    }

    fn file_name(&self) -> String {
        format!("run_{:03}_{:05}_{:06}.txt", self.pass, self.group, self.seq)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pass, self.group, self.seq)
    }
}

/// Sorted run file. One record per line, `\n` terminated.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl Run {
    /// Writes already sorted records to a new run file in `dir`.
    pub fn build<'a>(
        dir: &Path,
        id: RunId,
        records: impl IntoIterator<Item = LineRecord<'a>>,
        buf_size: usize,
    ) -> Result<Self, SortError> {
        let mut writer = RecordWriter::create(&dir.join(id.file_name()), buf_size)?;
        for record in records {
            writer.write_line(record.raw())?;
        }

        return writer.finish_run(id);
    }

    /// Creates a writer for a run whose records are produced incrementally.
    pub fn writer(dir: &Path, id: RunId, buf_size: usize) -> Result<RecordWriter, SortError> {
        RecordWriter::create(&dir.join(id.file_name()), buf_size)
    }

    /// Opens the run for a forward-only read.
    pub fn open(&self, buf_size: usize) -> Result<RunReader, SortError> {
        let file = fs::File::open(&self.path).map_err(|err| SortError::IO(self.path.clone(), err))?;
        return Ok(RunReader::new(&self.path, io::BufReader::with_capacity(buf_size, file)));
    }

    /// Deletes the run file.
    pub fn remove(self) -> Result<(), SortError> {
        fs::remove_file(&self.path).map_err(|err| SortError::IO(self.path, err))
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the run.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Run file size.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Line writer keeping track of written records.
pub struct RecordWriter<W: Write = io::BufWriter<fs::File>> {
    path: PathBuf,
    writer: W,
    records: u64,
    bytes: u64,
}

impl RecordWriter {
    /// Creates (or truncates) a file and returns a buffered writer for it.
    pub fn create(path: &Path, buf_size: usize) -> Result<Self, SortError> {
        let file = fs::File::create(path).map_err(|err| SortError::IO(path.to_path_buf(), err))?;
        return Ok(RecordWriter::new(path, io::BufWriter::with_capacity(buf_size, file)));
    }

    /// Flushes the file and turns it into a run.
    pub fn finish_run(mut self, id: RunId) -> Result<Run, SortError> {
        self.flush()?;

        return Ok(Run {
            id,
            path: self.path,
            records: self.records,
            bytes: self.bytes,
        });
    }
}

impl<W: Write> RecordWriter<W> {
    /// Wraps a writer. `path` is only used to give errors context.
    pub fn new(path: &Path, writer: W) -> Self {
        RecordWriter {
            path: path.to_path_buf(),
            writer,
            records: 0,
            bytes: 0,
        }
    }

    /// Writes a line appending the `\n` terminator.
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), SortError> {
        self.writer
            .write_all(line)
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|err| SortError::IO(self.path.clone(), err))?;

        self.records += 1;
        self.bytes += line.len() as u64 + 1;
        return Ok(());
    }

    pub fn flush(&mut self) -> Result<(), SortError> {
        self.writer.flush().map_err(|err| SortError::IO(self.path.clone(), err))
    }

    /// Number of lines written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Forward-only line reader.
pub struct RunReader<R: BufRead = io::BufReader<fs::File>> {
    path: PathBuf,
    reader: R,
}

impl<R: BufRead> RunReader<R> {
    /// Wraps a reader. `path` is only used to give errors context.
    pub fn new(path: &Path, reader: R) -> Self {
        RunReader {
            path: path.to_path_buf(),
            reader,
        }
    }

    /// Reads the next line into `buf` without its terminator.
    /// Returns `false` when the input is exhausted.
    pub fn next_line(&mut self, buf: &mut Vec<u8>) -> Result<bool, SortError> {
        buf.clear();
        let read = self
            .reader
            .read_until(b'\n', buf)
            .map_err(|err| SortError::IO(self.path.clone(), err))?;
        if read == 0 {
            return Ok(false);
        }

        let len = trim_line_end(buf).len();
        buf.truncate(len);

        return Ok(true);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
