//! Parallel split and merge execution.

use std::fs;
use std::io::{self, prelude::*, SeekFrom};
use std::path::Path;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::chunk::Run;
use crate::merger::{MergeSummary, RunMerger};
use crate::sort::SortError;
use crate::split::{LineSource, SplitOutput, Splitter};

/// Input byte range starting at a line start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partitions the first `size` bytes of a file into at most `parts` non-empty segments
/// whose boundaries are aligned to line starts.
pub fn split_segments(path: &Path, size: u64, parts: usize) -> Result<Vec<Segment>, SortError> {
    let parts = parts.max(1) as u64;
    let file = fs::File::open(path).map_err(|err| SortError::IO(path.to_path_buf(), err))?;
    let mut boundaries = vec![0];
    let mut line = Vec::new();

    for part in 1..parts {
        let target = (u128::from(size) * u128::from(part) / u128::from(parts)) as u64;
        let previous = boundaries.last().copied().unwrap_or(0);
        if target <= previous {
            continue;
        }

        // the boundary is the first line start at or after the target
        let mut reader = io::BufReader::new(&file);
        line.clear();
        let read = reader
            .seek(SeekFrom::Start(target - 1))
            .and_then(|_| reader.read_until(b'\n', &mut line))
            .map_err(|err| SortError::IO(path.to_path_buf(), err))?;

        let boundary = target - 1 + read as u64;
        if boundary >= size {
            break;
        }
        if boundary > previous {
            boundaries.push(boundary);
        }
    }
    boundaries.push(size);

    let segments = boundaries
        .windows(2)
        .map(|bounds| (bounds[0], bounds[1]))
        .filter(|(start, end)| start < end)
        .enumerate()
        .map(|(index, (start, end))| Segment { index, start, end })
        .collect();

    return Ok(segments);
}

/// Opens a reader over an input segment.
pub fn open_segment(
    path: &Path,
    segment: &Segment,
    buf_size: usize,
) -> Result<LineSource<io::BufReader<io::Take<fs::File>>>, SortError> {
    let mut file = fs::File::open(path).map_err(|err| SortError::IO(path.to_path_buf(), err))?;
    file.seek(SeekFrom::Start(segment.start))
        .map_err(|err| SortError::IO(path.to_path_buf(), err))?;

    let reader = io::BufReader::with_capacity(buf_size, file.take(segment.len()));
    let first_line = if segment.start == 0 { Some(1) } else { None };

    return Ok(LineSource::new(path, reader, segment.start, first_line));
}

/// Runs split and merge work on a bounded worker pool.
pub struct ParallelOrchestrator {
    thread_pool: rayon::ThreadPool,
}

impl ParallelOrchestrator {
    /// Creates an orchestrator with `threads_number` workers.
    /// If the parameter is [`None`] threads number will be selected based on available CPU core number.
    pub fn new(threads_number: Option<usize>) -> Result<Self, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(ParallelOrchestrator { thread_pool });
    }

    /// Degree of parallelism.
    pub fn degree(&self) -> usize {
        self.thread_pool.current_num_threads()
    }

    /// Splits the input into runs, one worker per line-aligned segment.
    /// Returned runs are ordered by their identity.
    pub fn split(
        &self,
        splitter: &Splitter<'_>,
        input: &Path,
        input_size: u64,
        rw_buf_size: usize,
    ) -> Result<SplitOutput, SortError> {
        let segments = split_segments(input, input_size, self.degree())?;
        log::debug!("input split into {} segments", segments.len());

        let runs = Mutex::new(Vec::new());
        let totals: Result<Vec<(u64, u64)>, SortError> = self.thread_pool.install(|| {
            segments
                .par_iter()
                .map(|segment| -> Result<(u64, u64), SortError> {
                    let source = open_segment(input, segment, rw_buf_size)?;
                    let output = splitter.split_batches(source, segment.index)?;
                    log::debug!(
                        "segment {} split into {} runs ({}..{})",
                        segment.index,
                        output.runs.len(),
                        segment.start,
                        segment.end
                    );

                    runs.lock().extend(output.runs);
                    return Ok((output.records, output.skipped));
                })
                .collect()
        });
        let totals = totals?;

        let mut runs = runs.into_inner();
        runs.sort_by_key(Run::id);

        return Ok(SplitOutput {
            runs,
            records: totals.iter().map(|(records, _)| records).sum(),
            skipped: totals.iter().map(|(_, skipped)| skipped).sum(),
        });
    }

    /// Merges runs into the output, groups of a pass running concurrently.
    pub fn merge(&self, merger: &RunMerger<'_>, runs: Vec<Run>, output: &Path) -> Result<MergeSummary, SortError> {
        merger.merge_runs(runs, output, Some(&self.thread_pool))
    }

    /// Applies `task` to every item concurrently, preserving item order in the result.
    pub fn run_all<T, R, F>(&self, items: Vec<T>, task: F) -> Result<Vec<R>, SortError>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R, SortError> + Sync + Send,
    {
        self.thread_pool.install(|| items.into_par_iter().map(task).collect())
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;

    use bytesize::MIB;
    use rstest::*;

    use super::{open_segment, split_segments, ParallelOrchestrator, Segment};
    use crate::cancel::CancellationToken;
    use crate::record::compare;
    use crate::sort::MalformedLinePolicy;
    use crate::split::Splitter;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn write_input(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("input.txt");
        fs::File::create(&path).unwrap().write_all(content.as_bytes()).unwrap();
        return path;
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(8)]
    #[case(64)]
    fn test_split_segments_are_line_aligned(tmp_dir: tempfile::TempDir, #[case] parts: usize) {
        let content: String = (0..20).map(|idx| format!("{}. {}\n", idx, "x".repeat(idx))).collect();
        let path = write_input(&tmp_dir, &content);
        let size = content.len() as u64;

        let segments = split_segments(&path, size, parts).unwrap();

        assert!(segments.len() <= parts);
        assert_eq!(segments.first().unwrap().start, 0);
        assert_eq!(segments.last().unwrap().end, size);
        for (index, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, index);
            assert!(!segment.is_empty());
            assert!(segment.start == 0 || content.as_bytes()[segment.start as usize - 1] == b'\n');
        }
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[rstest]
    fn test_split_segments_single_long_line(tmp_dir: tempfile::TempDir) {
        let content = format!("1. {}", "y".repeat(100));
        let path = write_input(&tmp_dir, &content);

        let segments = split_segments(&path, content.len() as u64, 4).unwrap();
        assert_eq!(
            segments,
            vec![Segment {
                index: 0,
                start: 0,
                end: content.len() as u64
            }]
        );
    }

    #[rstest]
    fn test_split_segments_empty_input(tmp_dir: tempfile::TempDir) {
        let path = write_input(&tmp_dir, "");
        assert!(split_segments(&path, 0, 4).unwrap().is_empty());
    }

    #[rstest]
    fn test_open_segment_positions(tmp_dir: tempfile::TempDir) {
        let path = write_input(&tmp_dir, "1. a\n2. b\n3. c\n");
        let segment = Segment {
            index: 1,
            start: 5,
            end: 10,
        };

        let mut source = open_segment(&path, &segment, 16).unwrap();
        let line = source.next_line().unwrap().unwrap();
        assert_eq!(line.bytes, b"2. b");
        assert_eq!(line.offset, 5);
        assert_eq!(line.number, None);
        assert!(source.next_line().unwrap().is_none());
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    fn test_parallel_split_keeps_every_record(tmp_dir: tempfile::TempDir, #[case] threads: usize) {
        let content: String = (0..1000).rev().map(|idx| format!("{}. word{}\n", idx, idx % 31)).collect();
        let path = write_input(&tmp_dir, &content);
        let runs_dir = tempfile::tempdir_in(tmp_dir.path()).unwrap();

        let cancel = CancellationToken::new();
        let orchestrator = ParallelOrchestrator::new(Some(threads)).unwrap();
        let splitter = Splitter::new(
            compare,
            MalformedLinePolicy::Strict,
            MIB,
            Some(100),
            64,
            runs_dir.path(),
            &cancel,
        );

        let output = orchestrator.split(&splitter, &path, content.len() as u64, 64).unwrap();

        assert_eq!(output.records, 1000);
        assert_eq!(output.runs.iter().map(|run| run.records()).sum::<u64>(), 1000);
        let ids: Vec<_> = output.runs.iter().map(|run| run.id()).collect();
        let mut sorted_ids = ids.clone();
        sorted_ids.sort();
        assert_eq!(ids, sorted_ids);

        let mut actual: Vec<String> = output
            .runs
            .iter()
            .flat_map(|run| fs::read_to_string(run.path()).unwrap().lines().map(str::to_string).collect::<Vec<_>>())
            .collect();
        actual.sort();
        let mut expected: Vec<String> = content.lines().map(str::to_string).collect();
        expected.sort();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_run_all_preserves_order() {
        let orchestrator = ParallelOrchestrator::new(Some(3)).unwrap();
        let result = orchestrator.run_all((0..100).collect(), |item: u64| Ok(item * 2)).unwrap();

        assert_eq!(result, (0..100).map(|item| item * 2).collect::<Vec<_>>());
    }
}
