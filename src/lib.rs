//! `ext-line-sort` is an external sort of line files too large to fit in memory.
//!
//! Every input line has the form `<number>. <text>`. Lines are ordered by the text part (ordinal byte order,
//! case-sensitive) and then by the number. Sorting is achieved in two phases. During the first phase the input
//! is split into batches that each fit in memory, every batch is sorted and saved to a temporary run file.
//! During the second phase the runs are merged together, in several passes if there are more runs than the
//! merge fan-in. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `ext-line-sort` supports the following features:
//!
//! * **Multithreading support:**
//!   the input is split into line-aligned segments processed in parallel, merge groups of a pass are merged
//!   concurrently. The output does not depend on the number of threads.
//! * **Bounded memory:**
//!   the memory buffer is derived from a caller hint and the input size and is never exceeded by a batch.
//! * **Several run generation strategies:**
//!   parallel batches, replacement selection or partitioning by the first text byte.
//! * **Malformed line policy:**
//!   malformed lines are either skipped or reported with their position.
//! * **Cooperative cancellation.**
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use bytesize::MB;
//!
//! use ext_line_sort::{ExternalSorter, ExternalSorterBuilder, SortStrategy};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_buffer_size(50 * MB)
//!         .with_strategy(SortStrategy::BatchChunked)
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter.sort(Path::new("input.txt"), Path::new("output.txt")).unwrap();
//!     println!("{} records sorted", summary.records);
//! }
//! ```

pub mod buffer;
pub mod cancel;
pub mod chunk;
pub mod merger;
pub mod parallel;
pub mod record;
pub mod sizing;
pub mod sort;
pub mod split;

#[cfg(test)]
mod fixture;

pub use buffer::{LineBuffer, LineBufferBuilder, SelectionHeap};
pub use cancel::CancellationToken;
pub use chunk::{Run, RunId};
pub use merger::{estimate_merge_passes, BinaryHeapMerger, MergeSummary, RunMerger};
pub use parallel::ParallelOrchestrator;
pub use record::{compare, compare_lines, CompareFn, LineRecord, RecordError};
pub use sizing::BufferSizingPolicy;
pub use sort::{
    ExternalSorter, ExternalSorterBuilder, MalformedLinePolicy, SortError, SortState, SortStatistics, SortStrategy,
    SortSummary,
};
