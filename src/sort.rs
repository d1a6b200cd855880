//! External sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::cancel::CancellationToken;
use crate::merger::{estimate_merge_passes, MergeSummary, RunMerger};
use crate::parallel::ParallelOrchestrator;
use crate::record::{self, CompareFn, RecordError};
use crate::sizing::{self, BufferSizingPolicy};
use crate::split::{LineSource, Partition, SplitOutput, Splitter};

/// Default number of runs merged at once.
pub const DEFAULT_FAN_IN: usize = 10;
/// Disk space needed relative to the input size: the input itself, the output and temporary runs.
pub const DISK_HEADROOM_FACTOR: u64 = 3;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Input file does not exist.
    InputNotFound(PathBuf),
    /// Input line violates the `<number>. <text>` grammar (strict mode only).
    MalformedRecord {
        path: PathBuf,
        /// One-based line number if known.
        line: Option<u64>,
        /// Byte offset of the line start.
        offset: u64,
        error: RecordError,
    },
    /// Read, write or delete failure.
    IO(PathBuf, io::Error),
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Sorting has been canceled.
    Canceled,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InputNotFound(_) => None,
            SortError::MalformedRecord { error, .. } => Some(error),
            SortError::IO(_, err) => Some(err),
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::Canceled => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InputNotFound(path) => write!(f, "input file {} not found", path.display()),
            SortError::MalformedRecord {
                path,
                line: Some(line),
                offset,
                error,
            } => write!(
                f,
                "malformed record at {}:{} (offset {}): {}",
                path.display(),
                line,
                offset,
                error
            ),
            SortError::MalformedRecord {
                path,
                line: None,
                offset,
                error,
            } => write!(f, "malformed record in {} at offset {}: {}", path.display(), offset, error),
            SortError::IO(path, err) => write!(f, "I/O operation on {} failed: {}", path.display(), err),
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Canceled => write!(f, "sorting canceled"),
        }
    }
}

/// Handling of lines violating the `<number>. <text>` grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedLinePolicy {
    /// Malformed lines are skipped and counted.
    #[default]
    Tolerant,
    /// The first malformed line aborts sorting.
    Strict,
}

/// Run generation strategy. Every strategy produces the same output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortStrategy {
    /// Input segments are split into sorted batches in parallel, then merged.
    #[default]
    BatchChunked,
    /// A single reader feeds a replacement selection heap producing fewer, longer runs, then merged.
    BoundedMemoryStreaming,
    /// Lines are routed into partitions by the first key byte, partitions are sorted concurrently and
    /// concatenated. Requires the default comparator: with a custom one the sorter falls back to
    /// [`SortStrategy::BatchChunked`].
    PrefixPartitioned,
}

/// Sorter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortState {
    Idle,
    Validating,
    Splitting,
    Merging,
    Completed,
    Failed,
}

/// Sorting result summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortSummary {
    pub strategy: SortStrategy,
    pub input_size_bytes: u64,
    pub buffer_size_bytes: u64,
    /// Number of records written to the output.
    pub records: u64,
    /// Number of skipped malformed lines.
    pub skipped: u64,
    /// Number of runs produced by the split phase.
    pub runs: usize,
    pub merge_passes: usize,
}

/// Sorting cost estimate computed from the input metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortStatistics {
    pub file_size_bytes: u64,
    pub effective_buffer_size_bytes: u64,
    pub estimated_run_count: u64,
    pub estimated_merge_passes: u64,
    pub estimated_io_operations: u64,
}

impl Display for SortStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file size: {}, buffer size: {}, estimated runs: {}, merge passes: {}, I/O operations: {}",
            ByteSize(self.file_size_bytes).to_string_as(true),
            ByteSize(self.effective_buffer_size_bytes).to_string_as(true),
            self.estimated_run_count,
            self.estimated_merge_passes,
            self.estimated_io_operations
        )
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Memory buffer size hint.
    buffer_size: u64,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Record compare function.
    compare: CompareFn,
    /// Whether `compare` is the default key-first order.
    default_compare: bool,
    malformed_line_policy: MalformedLinePolicy,
    cancellation_token: CancellationToken,
    fan_in: usize,
    strategy: SortStrategy,
    /// Number of records per split batch.
    run_record_limit: Option<usize>,
    sizing_policy: BufferSizingPolicy,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(self)
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets memory buffer size hint. The effective size is derived from it and the input size.
    pub fn with_buffer_size(mut self, buffer_size: u64) -> ExternalSorterBuilder {
        self.buffer_size = buffer_size;
        return self;
    }

    /// Sets run read/write buffer size. By default it is a share of the effective memory buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets record compare function.
    pub fn with_comparator(mut self, compare: CompareFn) -> ExternalSorterBuilder {
        self.compare = compare;
        self.default_compare = false;
        return self;
    }

    /// Sets malformed line handling.
    pub fn with_malformed_line_policy(mut self, policy: MalformedLinePolicy) -> ExternalSorterBuilder {
        self.malformed_line_policy = policy;
        return self;
    }

    /// Sets the token sorting can be canceled with.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> ExternalSorterBuilder {
        self.cancellation_token = token;
        return self;
    }

    /// Sets maximum number of runs merged at once.
    pub fn with_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder {
        self.fan_in = fan_in;
        return self;
    }

    /// Sets run generation strategy.
    pub fn with_strategy(mut self, strategy: SortStrategy) -> ExternalSorterBuilder {
        self.strategy = strategy;
        return self;
    }

    /// Sets number of records after which a split batch is closed.
    pub fn with_run_record_limit(mut self, limit: usize) -> ExternalSorterBuilder {
        self.run_record_limit = Some(limit);
        return self;
    }

    /// Sets buffer sizing policy.
    pub fn with_sizing_policy(mut self, policy: BufferSizingPolicy) -> ExternalSorterBuilder {
        self.sizing_policy = policy;
        return self;
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            buffer_size: sizing::DEFAULT_BUFFER_SIZE,
            rw_buf_size: None,
            compare: record::compare,
            default_compare: true,
            malformed_line_policy: MalformedLinePolicy::default(),
            cancellation_token: CancellationToken::new(),
            fan_in: DEFAULT_FAN_IN,
            strategy: SortStrategy::default(),
            run_record_limit: None,
            sizing_policy: BufferSizingPolicy::default(),
        }
    }
}

/// Parameters of a single sort invocation.
struct SortPlan<'a> {
    input: &'a Path,
    input_size: u64,
    output: &'a Path,
    buffer_size: u64,
    rw_buf_size: usize,
    tmp_dir: &'a Path,
}

/// External sorter.
pub struct ExternalSorter {
    orchestrator: ParallelOrchestrator,
    config: ExternalSorterBuilder,
    state: Mutex<SortState>,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    pub fn new(mut config: ExternalSorterBuilder) -> Result<Self, SortError> {
        if config.strategy == SortStrategy::PrefixPartitioned && !config.default_compare {
            log::warn!("prefix partitioning requires the default record order, using batch chunked strategy");
            config.strategy = SortStrategy::BatchChunked;
        }

        return Ok(ExternalSorter {
            orchestrator: ParallelOrchestrator::new(config.threads_number)?,
            config,
            state: Mutex::new(SortState::Idle),
        });
    }

    /// State of the most recently started sort invocation.
    ///
    /// The state is shared by the sorter: when [`ExternalSorter::sort`] is called from several threads at
    /// once it reflects whichever call updated it last. Use the result of each call to tell them apart.
    pub fn state(&self) -> SortState {
        *self.state.lock()
    }

    fn set_state(&self, state: SortState) {
        log::debug!("sorter state: {:?}", state);
        *self.state.lock() = state;
    }

    /// Sorts the `input` file writing the result to `output`.
    ///
    /// Temporary data is stored in a uniquely named directory removed when sorting finishes, successfully or not.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<SortSummary, SortError> {
        self.set_state(SortState::Validating);

        let result = self.sort_file(input, output);
        match &result {
            Ok(summary) => {
                self.set_state(SortState::Completed);
                log::info!(
                    "sorting done ({} records, {} runs, {} merge passes)",
                    summary.records,
                    summary.runs,
                    summary.merge_passes
                );
            }
            Err(_) => self.set_state(SortState::Failed),
        }

        return result;
    }

    /// Estimates sorting cost from the input metadata without reading it.
    pub fn statistics(&self, input: &Path, buffer_size_hint: u64) -> Result<SortStatistics, SortError> {
        let file_size_bytes = input_size(input)?;
        let effective_buffer_size_bytes = self
            .config
            .sizing_policy
            .effective_buffer_size(buffer_size_hint, file_size_bytes);
        let estimated_run_count = sizing::estimate_run_count(file_size_bytes, effective_buffer_size_bytes);
        let estimated_merge_passes = estimate_merge_passes(estimated_run_count, self.config.fan_in);

        return Ok(SortStatistics {
            file_size_bytes,
            effective_buffer_size_bytes,
            estimated_run_count,
            estimated_merge_passes,
            estimated_io_operations: estimated_merge_passes * 2 + 1,
        });
    }

    fn sort_file(&self, input: &Path, output: &Path) -> Result<SortSummary, SortError> {
        let input_size = input_size(input)?;
        let buffer_size = self
            .config
            .sizing_policy
            .effective_buffer_size(self.config.buffer_size, input_size);
        log::info!(
            "sorting {} ({}, buffer: {}, strategy: {:?})",
            input.display(),
            ByteSize(input_size).to_string_as(true),
            ByteSize(buffer_size).to_string_as(true),
            self.config.strategy
        );

        if input_size == 0 {
            log::info!("input is empty");
            fs::File::create(output).map_err(|err| SortError::IO(output.to_path_buf(), err))?;
            return Ok(self.summary(input_size, buffer_size, SplitOutput::default(), 0, 0));
        }

        let tmp_base = match &self.config.tmp_dir {
            Some(tmp_dir) => tmp_dir.to_path_buf(),
            None => std::env::temp_dir(),
        };
        check_disk_headroom(&tmp_base, input_size);

        let tmp_dir = init_tmp_directory(&tmp_base)?;
        let plan = SortPlan {
            input,
            input_size,
            output,
            buffer_size,
            rw_buf_size: self
                .config
                .rw_buf_size
                .unwrap_or_else(|| sizing::stream_buffer_size(buffer_size, self.config.fan_in)),
            tmp_dir: tmp_dir.path(),
        };

        let result = match self.config.strategy {
            SortStrategy::BatchChunked => self.sort_batch_chunked(&plan),
            SortStrategy::BoundedMemoryStreaming => self.sort_streaming(&plan),
            SortStrategy::PrefixPartitioned => self.sort_prefix_partitioned(&plan),
        };

        let tmp_path = tmp_dir.path().to_path_buf();
        if let Err(err) = tmp_dir.close() {
            log::warn!("temporary directory {} not removed: {}", tmp_path.display(), err);
        }

        let summary = result?;
        if summary.skipped > 0 {
            log::warn!("{} malformed lines skipped", summary.skipped);
        }

        return Ok(summary);
    }

    /// Memory a single concurrent worker may use.
    fn worker_budget(&self, buffer_size: u64) -> u64 {
        (buffer_size / self.orchestrator.degree() as u64).max(1)
    }

    /// Plan of a single concurrent worker, stream buffers shared by all workers.
    fn worker_plan<'a>(&self, plan: &SortPlan<'a>) -> SortPlan<'a> {
        SortPlan {
            rw_buf_size: (plan.rw_buf_size / self.orchestrator.degree()).max(1),
            ..*plan
        }
    }

    fn splitter<'a>(&'a self, plan: &SortPlan<'a>, memory_budget: u64, tmp_dir: &'a Path) -> Splitter<'a> {
        Splitter::new(
            self.config.compare,
            self.config.malformed_line_policy,
            memory_budget,
            self.config.run_record_limit,
            plan.rw_buf_size,
            tmp_dir,
            &self.config.cancellation_token,
        )
    }

    fn merger<'a>(&'a self, plan: &SortPlan<'a>, tmp_dir: &'a Path) -> RunMerger<'a> {
        RunMerger::new(
            self.config.compare,
            self.config.fan_in,
            plan.rw_buf_size,
            tmp_dir,
            &self.config.cancellation_token,
        )
    }

    fn sort_batch_chunked(&self, plan: &SortPlan<'_>) -> Result<SortSummary, SortError> {
        self.set_state(SortState::Splitting);
        let worker_plan = self.worker_plan(plan);
        let splitter = self.splitter(&worker_plan, self.worker_budget(plan.buffer_size), plan.tmp_dir);
        let mut split = self
            .orchestrator
            .split(&splitter, plan.input, plan.input_size, worker_plan.rw_buf_size)?;
        log::info!("input split into {} runs", split.runs.len());

        self.set_state(SortState::Merging);
        let runs = std::mem::take(&mut split.runs);
        let run_count = runs.len();
        let merge = self
            .orchestrator
            .merge(&self.merger(plan, plan.tmp_dir), runs, plan.output)?;

        return Ok(self.summary(plan.input_size, plan.buffer_size, split, run_count, merge.passes));
    }

    fn sort_streaming(&self, plan: &SortPlan<'_>) -> Result<SortSummary, SortError> {
        self.set_state(SortState::Splitting);
        let splitter = self.splitter(plan, plan.buffer_size, plan.tmp_dir);
        let mut split = splitter.split_selection(open_input(plan.input, plan.rw_buf_size)?, 0)?;
        log::info!("input split into {} runs", split.runs.len());

        self.set_state(SortState::Merging);
        let runs = std::mem::take(&mut split.runs);
        let run_count = runs.len();
        let merge = self
            .orchestrator
            .merge(&self.merger(plan, plan.tmp_dir), runs, plan.output)?;

        return Ok(self.summary(plan.input_size, plan.buffer_size, split, run_count, merge.passes));
    }

    fn sort_prefix_partitioned(&self, plan: &SortPlan<'_>) -> Result<SortSummary, SortError> {
        self.set_state(SortState::Splitting);
        let splitter = self.splitter(plan, plan.buffer_size, plan.tmp_dir);
        let (partitions, split) = splitter.partition(open_input(plan.input, plan.rw_buf_size)?, plan.tmp_dir)?;
        log::info!("input routed into {} partitions", partitions.len());

        self.set_state(SortState::Merging);
        let budget = self.worker_budget(plan.buffer_size);
        let worker_plan = self.worker_plan(plan);
        let sorted = self
            .orchestrator
            .run_all(partitions, |partition| self.sort_partition(&worker_plan, partition, budget))?;

        let mut writer = io::BufWriter::with_capacity(
            plan.rw_buf_size,
            fs::File::create(plan.output).map_err(|err| SortError::IO(plan.output.to_path_buf(), err))?,
        );
        for (path, _) in &sorted {
            if self.config.cancellation_token.is_cancelled() {
                return Err(SortError::Canceled);
            }

            let mut reader = fs::File::open(path).map_err(|err| SortError::IO(path.clone(), err))?;
            io::copy(&mut reader, &mut writer).map_err(|err| SortError::IO(plan.output.to_path_buf(), err))?;
            fs::remove_file(path).map_err(|err| SortError::IO(path.clone(), err))?;
        }
        writer
            .flush()
            .map_err(|err| SortError::IO(plan.output.to_path_buf(), err))?;

        let run_count: usize = sorted.iter().map(|(_, merge)| merge.runs).sum();
        let passes = sorted.iter().map(|(_, merge)| merge.summary.passes).max().unwrap_or(0);

        return Ok(self.summary(plan.input_size, plan.buffer_size, split, run_count, passes));
    }

    /// Sorts a single partition into its own directory. Returns the sorted file path.
    fn sort_partition(
        &self,
        plan: &SortPlan<'_>,
        partition: Partition,
        budget: u64,
    ) -> Result<(PathBuf, PartitionMerge), SortError> {
        let dir = plan.tmp_dir.join(format!("part_{:03}", partition.index));
        fs::create_dir(&dir).map_err(|err| SortError::IO(dir.clone(), err))?;

        let file = fs::File::open(&partition.path).map_err(|err| SortError::IO(partition.path.clone(), err))?;
        let source = LineSource::new(
            &partition.path,
            io::BufReader::with_capacity(plan.rw_buf_size, file),
            0,
            Some(1),
        );

        let split = self.splitter(plan, budget, &dir).split_batches(source, partition.index)?;
        fs::remove_file(&partition.path).map_err(|err| SortError::IO(partition.path.clone(), err))?;

        let sorted = dir.join("sorted.txt");
        let runs = split.runs.len();
        let summary = self.merger(plan, &dir).merge_runs(split.runs, &sorted, None)?;
        log::debug!(
            "partition {} sorted ({} records, {} runs, {} merge passes)",
            partition.index,
            summary.records,
            runs,
            summary.passes
        );

        return Ok((sorted, PartitionMerge { runs, summary }));
    }

    fn summary(
        &self,
        input_size: u64,
        buffer_size: u64,
        split: SplitOutput,
        runs: usize,
        merge_passes: usize,
    ) -> SortSummary {
        SortSummary {
            strategy: self.config.strategy,
            input_size_bytes: input_size,
            buffer_size_bytes: buffer_size,
            records: split.records,
            skipped: split.skipped,
            runs,
            merge_passes,
        }
    }
}

struct PartitionMerge {
    runs: usize,
    summary: MergeSummary,
}

fn input_size(input: &Path) -> Result<u64, SortError> {
    let metadata = fs::metadata(input).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => SortError::InputNotFound(input.to_path_buf()),
        _ => SortError::IO(input.to_path_buf(), err),
    })?;

    if !metadata.is_file() {
        return Err(SortError::IO(
            input.to_path_buf(),
            io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }

    return Ok(metadata.len());
}

fn open_input(input: &Path, buf_size: usize) -> Result<LineSource<io::BufReader<fs::File>>, SortError> {
    let file = fs::File::open(input).map_err(|err| SortError::IO(input.to_path_buf(), err))?;
    return Ok(LineSource::new(input, io::BufReader::with_capacity(buf_size, file), 0, Some(1)));
}

fn init_tmp_directory(tmp_path: &Path) -> Result<tempfile::TempDir, SortError> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("linesort-")
        .tempdir_in(tmp_path)
        .map_err(|err| SortError::TempDir(err))?;

    log::info!("using {} as a temporary directory", tmp_dir.path().display());

    return Ok(tmp_dir);
}

fn check_disk_headroom(location: &Path, input_size: u64) {
    let required = input_size.saturating_mul(DISK_HEADROOM_FACTOR);

    match available_space(location) {
        Some(available) if available < required => log::warn!(
            "low disk space in {}: {} available, about {} required",
            location.display(),
            ByteSize(available).to_string_as(true),
            ByteSize(required).to_string_as(true)
        ),
        Some(available) => log::debug!(
            "disk space in {}: {} available",
            location.display(),
            ByteSize(available).to_string_as(true)
        ),
        None => log::debug!("free disk space in {} unknown", location.display()),
    }
}

/// Space available on the disk mounted closest to `path`.
fn available_space(path: &Path) -> Option<u64> {
    let path = fs::canonicalize(path).ok()?;
    let disks = Disks::new_with_refreshed_list();
    let mount_points: Vec<&Path> = disks.list().iter().map(|disk| disk.mount_point()).collect();

    let index = closest_mount_point(&path, &mount_points)?;
    return Some(disks.list()[index].available_space());
}

/// Index of the mount point with the longest prefix of `path`.
fn closest_mount_point(path: &Path, mount_points: &[&Path]) -> Option<usize> {
    mount_points
        .iter()
        .enumerate()
        .filter(|(_, mount_point)| path.starts_with(mount_point))
        .max_by_key(|(_, mount_point)| mount_point.components().count())
        .map(|(index, _)| index)
}
