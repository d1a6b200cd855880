//! Binary heap merger.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::prelude::*;
use std::path::Path;

use rayon::prelude::*;
use serde::Serialize;

use crate::cancel::{CancellationToken, CHECK_INTERVAL};
use crate::chunk::{RecordWriter, Run, RunId, RunReader};
use crate::record::{total_cmp, CompareFn, LineRecord};
use crate::sort::SortError;

/// Head record of an open run.
struct FrontierEntry {
    line: Vec<u8>,
    key_offset: usize,
    number: u64,
    run: usize,
    compare: CompareFn,
}

impl FrontierEntry {
    fn record(&self) -> LineRecord<'_> {
        LineRecord::from_parts(&self.line, self.key_offset, self.number)
    }

    /// Re-parses the line after it has been replaced by the next one of the same run.
    fn reparse(&mut self) {
        let record = LineRecord::parse_lenient(&self.line);
        let (key_offset, number) = (record.key_offset(), record.number());
        self.key_offset = key_offset;
        self.number = number;
    }
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        total_cmp(self.compare, &self.record(), &other.record()).then(self.run.cmp(&other.run))
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted runs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of records,
/// *n* is the number of runs.
pub struct BinaryHeapMerger<R: BufRead> {
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<FrontierEntry>>,
    readers: Vec<RunReader<R>>,
    compare: CompareFn,
}

impl<R: BufRead> BinaryHeapMerger<R> {
    /// Creates an instance of a binary heap merger using run readers as inputs.
    /// Run records should be sorted in ascending order otherwise the result is undefined.
    pub fn new(readers: Vec<RunReader<R>>, compare: CompareFn) -> Self {
        let items = BinaryHeap::with_capacity(readers.len());

        return BinaryHeapMerger {
            items,
            readers,
            compare,
        };
    }

    /// Writes every record of every run to `writer` in ascending order.
    /// Returns the number of written records.
    pub fn merge_into<W: Write>(
        mut self,
        writer: &mut RecordWriter<W>,
        cancel: &CancellationToken,
    ) -> Result<u64, SortError> {
        for run in 0..self.readers.len() {
            let mut line = Vec::new();
            if self.readers[run].next_line(&mut line)? {
                let mut entry = FrontierEntry {
                    line,
                    key_offset: 0,
                    number: 0,
                    run,
                    compare: self.compare,
                };
                entry.reparse();
                self.items.push(Reverse(entry));
            }
        }

        let mut written: u64 = 0;
        while let Some(Reverse(mut entry)) = self.items.pop() {
            writer.write_line(&entry.line)?;
            written += 1;

            if written % CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                writer.flush()?;
                return Err(SortError::Canceled);
            }

            if self.readers[entry.run].next_line(&mut entry.line)? {
                entry.reparse();
                self.items.push(Reverse(entry));
            }
        }

        writer.flush()?;
        return Ok(written);
    }
}

/// Merge phase summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Number of merge passes performed.
    pub passes: usize,
    /// Number of records written to the output.
    pub records: u64,
}

/// Multi-pass run merger with bounded fan-in.
pub struct RunMerger<'a> {
    compare: CompareFn,
    fan_in: usize,
    rw_buf_size: usize,
    tmp_dir: &'a Path,
    cancel: &'a CancellationToken,
}

impl<'a> RunMerger<'a> {
    /// # Arguments
    /// * `compare` - Record order the runs are sorted by
    /// * `fan_in` - Maximum number of runs merged at once, values below 2 are raised to 2
    /// * `rw_buf_size` - Run and output read/write buffer size
    /// * `tmp_dir` - Directory intermediate runs are written to
    /// * `cancel` - Cancellation token
    pub fn new(
        compare: CompareFn,
        fan_in: usize,
        rw_buf_size: usize,
        tmp_dir: &'a Path,
        cancel: &'a CancellationToken,
    ) -> Self {
        RunMerger {
            compare,
            fan_in: fan_in.max(2),
            rw_buf_size,
            tmp_dir,
            cancel,
        }
    }

    /// Merges `runs` into the file at `output`, consuming and deleting every run.
    ///
    /// Groups of a pass are merged on `pool` concurrently if it is provided, otherwise one after another.
    /// Runs are merged in the given order, which only affects intermediate file names.
    pub fn merge_runs(
        &self,
        mut runs: Vec<Run>,
        output: &Path,
        pool: Option<&rayon::ThreadPool>,
    ) -> Result<MergeSummary, SortError> {
        let mut passes = 0;

        while runs.len() > self.fan_in {
            if self.cancel.is_cancelled() {
                return Err(SortError::Canceled);
            }

            passes += 1;
            log::debug!("merge pass {}: merging {} runs (fan-in: {})", passes, runs.len(), self.fan_in);

            let mut groups: Vec<Vec<Run>> = Vec::new();
            let mut remaining = runs.into_iter().peekable();
            while remaining.peek().is_some() {
                groups.push(remaining.by_ref().take(self.fan_in).collect());
            }

            let buf_size = self.pass_buf_size(pool, groups.len());
            let merged: Result<Vec<Run>, SortError> = match pool {
                Some(pool) => pool.install(|| {
                    groups
                        .into_par_iter()
                        .enumerate()
                        .map(|(group, runs)| self.merge_group(RunId::new(passes, group, 0), runs, buf_size))
                        .collect()
                }),
                None => groups
                    .into_iter()
                    .enumerate()
                    .map(|(group, runs)| self.merge_group(RunId::new(passes, group, 0), runs, buf_size))
                    .collect(),
            };
            runs = merged?;
        }

        if self.cancel.is_cancelled() {
            return Err(SortError::Canceled);
        }

        let mut writer = RecordWriter::create(output, self.rw_buf_size)?;
        if runs.len() > 1 {
            passes += 1;
        }
        log::debug!("merging {} runs into {}", runs.len(), output.display());
        let records = self.merge(runs, &mut writer, self.rw_buf_size)?;

        return Ok(MergeSummary { passes, records });
    }

    /// Stream buffer size for a pass of `groups` groups. Groups merged concurrently share the buffer.
    fn pass_buf_size(&self, pool: Option<&rayon::ThreadPool>, groups: usize) -> usize {
        let concurrent = match pool {
            Some(pool) => pool.current_num_threads().min(groups).max(1),
            None => 1,
        };
        (self.rw_buf_size / concurrent).max(1)
    }

    /// Merges a group into a new intermediate run. A single-run group is carried forward unchanged.
    fn merge_group(&self, id: RunId, mut runs: Vec<Run>, buf_size: usize) -> Result<Run, SortError> {
        if runs.len() == 1 {
            if let Some(run) = runs.pop() {
                log::debug!("run {} carried forward", run.id());
                return Ok(run);
            }
        }

        let mut writer = Run::writer(self.tmp_dir, id, buf_size)?;
        self.merge(runs, &mut writer, buf_size)?;
        let run = writer.finish_run(id)?;

        log::debug!("run {} merged ({} records, {} bytes)", run.id(), run.records(), run.bytes());
        return Ok(run);
    }

    fn merge<W: Write>(
        &self,
        runs: Vec<Run>,
        writer: &mut RecordWriter<W>,
        buf_size: usize,
    ) -> Result<u64, SortError> {
        let readers = runs
            .iter()
            .map(|run| run.open(buf_size))
            .collect::<Result<Vec<_>, _>>()?;

        let written = BinaryHeapMerger::new(readers, self.compare).merge_into(writer, self.cancel)?;
        for run in runs {
            run.remove()?;
        }

        return Ok(written);
    }
}

/// Number of merge passes needed to reduce `run_count` runs to one with the given fan-in.
pub fn estimate_merge_passes(run_count: u64, fan_in: usize) -> u64 {
    let fan_in = fan_in.max(2) as u64;
    let mut runs = run_count;
    let mut passes = 0;
    while runs > 1 {
        runs = runs.div_ceil(fan_in);
        passes += 1;
    }

    return passes;
}
