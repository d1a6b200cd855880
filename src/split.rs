//! Input splitting into sorted runs.

use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::buffer::{LineBuffer, LineBufferBuilder, SelectionHeap};
use crate::cancel::{CancellationToken, CHECK_INTERVAL};
use crate::chunk::{RecordWriter, Run, RunId};
use crate::record::{trim_line_end, CompareFn, LineRecord};
use crate::sizing;
use crate::sort::{MalformedLinePolicy, SortError};

/// Number of prefix partitions: one for the empty key and one per possible first key byte.
pub const PARTITIONS: usize = 257;

/// Input line together with its position.
#[derive(Debug, Clone, Copy)]
pub struct Line<'a> {
    pub bytes: &'a [u8],
    /// Byte offset of the line start in the input.
    pub offset: u64,
    /// One-based line number, known only when the input is read from its beginning.
    pub number: Option<u64>,
}

/// Sequential line reader keeping track of line positions.
pub struct LineSource<R: BufRead> {
    path: PathBuf,
    reader: R,
    buf: Vec<u8>,
    offset: u64,
    number: Option<u64>,
}

impl<R: BufRead> LineSource<R> {
    /// # Arguments
    /// * `path` - Input path, used for error reporting
    /// * `reader` - Reader positioned at a line start
    /// * `offset` - Input offset the reader is positioned at
    /// * `first_line` - Number of the first line if known
    pub fn new(path: &Path, reader: R, offset: u64, first_line: Option<u64>) -> Self {
        LineSource {
            path: path.to_path_buf(),
            reader,
            buf: Vec::new(),
            offset,
            number: first_line,
        }
    }

    /// Reads the next line stripping its terminator.
    pub fn next_line(&mut self) -> Result<Option<Line<'_>>, SortError> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|err| SortError::IO(self.path.clone(), err))?;
        if read == 0 {
            return Ok(None);
        }

        let line = Line {
            bytes: trim_line_end(&self.buf),
            offset: self.offset,
            number: self.number,
        };
        self.offset += read as u64;
        self.number = self.number.map(|number| number + 1);

        return Ok(Some(line));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Split phase summary.
#[derive(Debug, Default)]
pub struct SplitOutput {
    /// Produced runs.
    pub runs: Vec<Run>,
    /// Number of admitted records.
    pub records: u64,
    /// Number of skipped malformed lines.
    pub skipped: u64,
}

/// Records routed into a prefix partition.
#[derive(Debug)]
pub struct Partition {
    /// Partition index: zero for the empty key, first key byte plus one otherwise.
    pub index: usize,
    pub path: PathBuf,
    pub records: u64,
}

/// Input splitter.
pub struct Splitter<'a> {
    compare: CompareFn,
    policy: MalformedLinePolicy,
    memory_budget: u64,
    record_limit: usize,
    rw_buf_size: usize,
    tmp_dir: &'a Path,
    cancel: &'a CancellationToken,
}

impl<'a> Splitter<'a> {
    /// # Arguments
    /// * `compare` - Record order runs are sorted by
    /// * `policy` - Malformed line handling
    /// * `memory_budget` - Memory a single batch (or selection heap) may take
    /// * `record_limit` - Number of records after which a batch is closed, derived from the budget if [`None`]
    /// * `rw_buf_size` - Read/write buffer size
    /// * `tmp_dir` - Directory runs are written to
    /// * `cancel` - Cancellation token
    pub fn new(
        compare: CompareFn,
        policy: MalformedLinePolicy,
        memory_budget: u64,
        record_limit: Option<usize>,
        rw_buf_size: usize,
        tmp_dir: &'a Path,
        cancel: &'a CancellationToken,
    ) -> Self {
        Splitter {
            compare,
            policy,
            memory_budget,
            record_limit: record_limit.unwrap_or_else(|| sizing::batch_record_target(memory_budget)),
            rw_buf_size,
            tmp_dir,
            cancel,
        }
    }

    /// Splits the input into runs of bounded in-memory batches.
    /// Runs get identities `(0, group, n)`.
    pub fn split_batches<R: BufRead>(&self, mut source: LineSource<R>, group: usize) -> Result<SplitOutput, SortError> {
        let path = source.path().to_path_buf();
        let builder = LineBufferBuilder::new(self.record_limit, self.memory_budget as usize, true);
        let mut buffer = builder.build();
        let mut output = SplitOutput::default();
        let mut seen: u64 = 0;

        while let Some(line) = source.next_line()? {
            seen += 1;
            if seen % CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                return Err(SortError::Canceled);
            }

            if let Some(record) = self.admit(&path, &line, &mut output.skipped)? {
                buffer.push(&record);
                output.records += 1;
            }

            if buffer.is_full() {
                let id = RunId::new(0, group, output.runs.len());
                output.runs.push(self.flush_batch(&mut buffer, id)?);
            }
        }

        if !buffer.is_empty() {
            let id = RunId::new(0, group, output.runs.len());
            output.runs.push(self.flush_batch(&mut buffer, id)?);
        }

        return Ok(output);
    }

    fn flush_batch(&self, buffer: &mut LineBuffer, id: RunId) -> Result<Run, SortError> {
        if self.cancel.is_cancelled() {
            return Err(SortError::Canceled);
        }

        log::debug!("sorting batch {} ({} records) ...", id, buffer.len());
        buffer.sort_by(self.compare);

        let run = Run::build(self.tmp_dir, id, buffer.records(), self.rw_buf_size)?;
        buffer.clear();

        log::debug!("run {} saved ({} bytes)", run.id(), run.bytes());
        return Ok(run);
    }

    /// Splits the input into runs using replacement selection.
    ///
    /// Records smaller than the last written one are held back for the next run, so runs are about twice as long
    /// as the memory budget on random input and a sorted input yields a single run.
    pub fn split_selection<R: BufRead>(
        &self,
        mut source: LineSource<R>,
        group: usize,
    ) -> Result<SplitOutput, SortError> {
        let path = source.path().to_path_buf();
        let mut heap = SelectionHeap::new(self.memory_budget as usize, self.compare);
        let mut current: Option<(u64, RunId, RecordWriter)> = None;
        let mut output = SplitOutput::default();
        let mut seen: u64 = 0;

        while let Some(line) = source.next_line()? {
            seen += 1;
            if seen % CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                return Err(SortError::Canceled);
            }

            if let Some(record) = self.admit(&path, &line, &mut output.skipped)? {
                heap.push(&record);
                output.records += 1;
            }

            while heap.is_full() && !heap.is_empty() {
                self.emit(&mut heap, &mut current, &mut output.runs, group)?;
            }
        }

        while !heap.is_empty() {
            self.emit(&mut heap, &mut current, &mut output.runs, group)?;
        }

        if let Some((_, id, writer)) = current.take() {
            output.runs.push(self.finish_run(writer, id)?);
        }

        return Ok(output);
    }

    /// Writes the heap minimum to the run it belongs to, starting a new run file if needed.
    fn emit(
        &self,
        heap: &mut SelectionHeap,
        current: &mut Option<(u64, RunId, RecordWriter)>,
        runs: &mut Vec<Run>,
        group: usize,
    ) -> Result<(), SortError> {
        let (run, line) = match heap.pop() {
            Some(head) => head,
            None => return Ok(()),
        };

        let switch = match current {
            Some((current_run, _, _)) => *current_run != run,
            None => true,
        };
        if switch {
            if let Some((_, id, writer)) = current.take() {
                runs.push(self.finish_run(writer, id)?);
            }
            if self.cancel.is_cancelled() {
                return Err(SortError::Canceled);
            }

            let id = RunId::new(0, group, runs.len());
            *current = Some((run, id, Run::writer(self.tmp_dir, id, self.rw_buf_size)?));
        }

        if let Some((_, _, writer)) = current {
            writer.write_line(line)?;
            if writer.records() % CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                writer.flush()?;
                return Err(SortError::Canceled);
            }
        }

        return Ok(());
    }

    fn finish_run(&self, writer: RecordWriter, id: RunId) -> Result<Run, SortError> {
        let run = writer.finish_run(id)?;
        log::debug!("run {} saved ({} records, {} bytes)", run.id(), run.records(), run.bytes());
        return Ok(run);
    }

    /// Routes every admitted line into a partition file in `dir` keyed by the first byte of the record key.
    /// Returns non-empty partitions in key order and the split summary without runs.
    pub fn partition<R: BufRead>(
        &self,
        mut source: LineSource<R>,
        dir: &Path,
    ) -> Result<(Vec<Partition>, SplitOutput), SortError> {
        let path = source.path().to_path_buf();
        let buf_size = self.partition_buf_size();
        let mut writers: Vec<Option<RecordWriter>> = (0..PARTITIONS).map(|_| None).collect();
        let mut output = SplitOutput::default();
        let mut seen: u64 = 0;

        while let Some(line) = source.next_line()? {
            seen += 1;
            if seen % CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                for writer in writers.iter_mut().flatten() {
                    writer.flush()?;
                }
                return Err(SortError::Canceled);
            }

            let record = match self.admit(&path, &line, &mut output.skipped)? {
                Some(record) => record,
                None => continue,
            };
            output.records += 1;

            let index = partition_index(&record);
            if writers[index].is_none() {
                writers[index] = Some(RecordWriter::create(&partition_path(dir, index), buf_size)?);
            }
            if let Some(writer) = &mut writers[index] {
                writer.write_line(record.raw())?;
            }
        }

        let mut partitions = Vec::new();
        for (index, writer) in writers.into_iter().enumerate() {
            if let Some(mut writer) = writer {
                writer.flush()?;
                partitions.push(Partition {
                    index,
                    path: partition_path(dir, index),
                    records: writer.records(),
                });
            }
        }

        log::debug!("input routed into {} partitions", partitions.len());
        return Ok((partitions, output));
    }

    /// Write buffer size of a partition writer, all of them open at once staying within the memory budget.
    fn partition_buf_size(&self) -> usize {
        sizing::partition_buffer_size(self.memory_budget, PARTITIONS).min(self.rw_buf_size.max(1))
    }

    /// Parses a line applying the malformed line policy.
    fn admit<'l>(
        &self,
        path: &Path,
        line: &Line<'l>,
        skipped: &mut u64,
    ) -> Result<Option<LineRecord<'l>>, SortError> {
        match LineRecord::parse(line.bytes) {
            Ok(record) => Ok(Some(record)),
            Err(error) => match self.policy {
                MalformedLinePolicy::Tolerant => {
                    *skipped += 1;
                    log::trace!("skipping malformed line at offset {}: {}", line.offset, error);
                    Ok(None)
                }
                MalformedLinePolicy::Strict => Err(SortError::MalformedRecord {
                    path: path.to_path_buf(),
                    line: line.number,
                    offset: line.offset,
                    error,
                }),
            },
        }
    }
}

fn partition_index(record: &LineRecord<'_>) -> usize {
    record.key().first().map_or(0, |byte| *byte as usize + 1)
}

fn partition_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("part_{:03}.txt", index))
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use bytesize::MIB;
    use rstest::*;

    use super::{LineSource, Splitter};
    use crate::cancel::CancellationToken;
    use crate::chunk::Run;
    use crate::record::{compare, RecordError};
    use crate::sort::{MalformedLinePolicy, SortError};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn source(input: &str) -> LineSource<&[u8]> {
        LineSource::new(Path::new("input.txt"), input.as_bytes(), 0, Some(1))
    }

    fn read_run(run: &Run) -> Vec<String> {
        std::fs::read_to_string(run.path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_line_source_positions() {
        let mut source = source("1. a\r\n22. bb\n3. c");
        let mut positions = Vec::new();
        while let Some(line) = source.next_line().unwrap() {
            positions.push((String::from_utf8(line.bytes.to_vec()).unwrap(), line.offset, line.number));
        }

        assert_eq!(
            positions,
            vec![
                ("1. a".to_string(), 0, Some(1)),
                ("22. bb".to_string(), 6, Some(2)),
                ("3. c".to_string(), 13, Some(3)),
            ]
        );
    }

    #[rstest]
    #[case(2, vec![vec!["1. Apple", "415. Apple"], vec!["2. Banana is yellow", "32. Cherry is the best"], vec!["30432. Something something something"]])]
    #[case(10, vec![vec!["1. Apple", "415. Apple", "2. Banana is yellow", "32. Cherry is the best", "30432. Something something something"]])]
    fn test_split_batches(tmp_dir: tempfile::TempDir, #[case] record_limit: usize, #[case] expected: Vec<Vec<&str>>) {
        let cancel = CancellationToken::new();
        let splitter = Splitter::new(
            compare,
            MalformedLinePolicy::Tolerant,
            MIB,
            Some(record_limit),
            64,
            tmp_dir.path(),
            &cancel,
        );

        let input = "415. Apple\n1. Apple\n32. Cherry is the best\n2. Banana is yellow\n30432. Something something something\n";
        let output = splitter.split_batches(source(input), 3).unwrap();

        assert_eq!(output.records, 5);
        assert_eq!(output.skipped, 0);
        let actual: Vec<Vec<String>> = output.runs.iter().map(read_run).collect();
        assert_eq!(actual, expected);
        for (seq, run) in output.runs.iter().enumerate() {
            assert_eq!((run.id().pass, run.id().group, run.id().seq), (0, 3, seq));
        }
    }

    #[rstest]
    fn test_split_tolerant_skips_malformed(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        let splitter =
            Splitter::new(compare, MalformedLinePolicy::Tolerant, MIB, None, 64, tmp_dir.path(), &cancel);

        let output = splitter
            .split_batches(source("2. Banana\ngarbage-no-separator\n\n-5. negative\n1. Apple\n"), 0)
            .unwrap();

        assert_eq!(output.records, 2);
        assert_eq!(output.skipped, 3);
        assert_eq!(read_run(&output.runs[0]), vec!["1. Apple", "2. Banana"]);
    }

    #[rstest]
    fn test_split_strict_reports_position(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        let splitter = Splitter::new(compare, MalformedLinePolicy::Strict, MIB, None, 64, tmp_dir.path(), &cancel);

        let result = splitter.split_batches(source("1. Apple\ngarbage-no-separator\n2. Banana\n"), 0);

        match result {
            Err(SortError::MalformedRecord {
                path,
                line,
                offset,
                error,
            }) => {
                assert_eq!(path, Path::new("input.txt"));
                assert_eq!(line, Some(2));
                assert_eq!(offset, 9);
                assert_eq!(error, RecordError::MissingSeparator);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[rstest]
    fn test_split_empty_input(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        let splitter = Splitter::new(compare, MalformedLinePolicy::Strict, MIB, None, 64, tmp_dir.path(), &cancel);

        let output = splitter.split_batches(source(""), 0).unwrap();
        assert!(output.runs.is_empty());
        assert_eq!(output.records, 0);
    }

    #[rstest]
    fn test_split_canceled(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let splitter = Splitter::new(compare, MalformedLinePolicy::Strict, MIB, None, 64, tmp_dir.path(), &cancel);

        let result = splitter.split_batches(source("1. a\n"), 0);
        assert!(matches!(result, Err(SortError::Canceled)));
    }

    #[rstest]
    fn test_split_selection_sorted_input_is_one_run(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        // fits two or three records only
        let splitter = Splitter::new(compare, MalformedLinePolicy::Tolerant, 150, None, 64, tmp_dir.path(), &cancel);

        let input: String = (0..50).map(|idx| format!("{}. word{:02}\n", idx, idx)).collect();
        let output = splitter.split_selection(source(&input), 0).unwrap();

        assert_eq!(output.runs.len(), 1);
        assert_eq!(output.runs[0].records(), 50);
    }

    #[rstest]
    fn test_split_selection_runs_are_sorted(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        let splitter = Splitter::new(compare, MalformedLinePolicy::Tolerant, 150, None, 64, tmp_dir.path(), &cancel);

        let input: String = (0..50).rev().map(|idx| format!("{}. word{:02}\n", idx, idx)).collect();
        let output = splitter.split_selection(source(&input), 2).unwrap();

        assert!(output.runs.len() > 1);
        assert_eq!(output.runs.iter().map(Run::records).sum::<u64>(), 50);
        for (seq, run) in output.runs.iter().enumerate() {
            assert_eq!(run.id().seq, seq);
            let lines = read_run(run);
            let mut sorted = lines.clone();
            sorted.sort_by(|a, b| crate::record::compare_lines(a.as_bytes(), b.as_bytes()));
            assert_eq!(lines, sorted);
        }
    }

    #[rstest]
    fn test_partition(tmp_dir: tempfile::TempDir) {
        let cancel = CancellationToken::new();
        let splitter =
            Splitter::new(compare, MalformedLinePolicy::Tolerant, MIB, None, 64, tmp_dir.path(), &cancel);

        let input = "3. banana\n1. \n2. apple\n4. bread\nbroken\n5. Zebra\n";
        let (partitions, output) = splitter.partition(source(input), tmp_dir.path()).unwrap();

        assert_eq!(output.records, 5);
        assert_eq!(output.skipped, 1);

        let indices: Vec<usize> = partitions.iter().map(|partition| partition.index).collect();
        assert_eq!(indices, vec![0, b'Z' as usize + 1, b'a' as usize + 1, b'b' as usize + 1]);

        let banana = std::fs::read_to_string(&partitions[3].path).unwrap();
        assert_eq!(banana, "3. banana\n4. bread\n");
        assert_eq!(partitions[3].records, 2);
    }

    #[rstest]
    #[case(64 * MIB, 8 * MIB as usize, 261123)]
    #[case(MIB, MIB as usize, 8 * 1024)]
    #[case(64 * MIB, 4096, 4096)]
    fn test_partition_buf_size(
        tmp_dir: tempfile::TempDir,
        #[case] memory_budget: u64,
        #[case] rw_buf_size: usize,
        #[case] expected: usize,
    ) {
        let cancel = CancellationToken::new();
        let splitter = Splitter::new(
            compare,
            MalformedLinePolicy::Tolerant,
            memory_budget,
            None,
            rw_buf_size,
            tmp_dir.path(),
            &cancel,
        );

        assert_eq!(splitter.partition_buf_size(), expected);
    }
}
