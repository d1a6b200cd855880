//! Buffer sizing policy.

use bytesize::{GIB, KIB, MIB};

/// Smallest buffer ever used.
pub const MIN_BUFFER_SIZE: u64 = 64 * KIB;
/// Largest buffer ever used regardless of input size.
pub const MAX_BUFFER_SIZE: u64 = 64 * MIB;
/// Buffer size used when the caller gives no hint.
pub const DEFAULT_BUFFER_SIZE: u64 = MIB;
/// Average in-memory record size estimate used to derive a batch record count target.
pub const AVERAGE_RECORD_SIZE: u64 = 64;
/// Smallest read/write buffer of a single stream.
pub const MIN_STREAM_BUFFER_SIZE: u64 = 8 * KIB;

/// Computes effective memory and I/O buffer sizes from the caller hint and the input size.
///
/// The hint is clamped into `[floor, ceiling]` where the ceiling is a share of the input size that shrinks as
/// the input grows, and the result is rounded to the nearest power of two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSizingPolicy {
    /// Lower bound.
    pub floor: u64,
    /// Absolute upper bound.
    pub cap: u64,
    /// Inputs below this size use `small_input_percent`.
    pub medium_input_threshold: u64,
    /// Inputs below this size (and above the medium threshold) use `medium_input_percent`.
    pub large_input_threshold: u64,
    pub small_input_percent: u64,
    pub medium_input_percent: u64,
    pub large_input_percent: u64,
}

impl Default for BufferSizingPolicy {
    fn default() -> Self {
        BufferSizingPolicy {
            floor: MIN_BUFFER_SIZE,
            cap: MAX_BUFFER_SIZE,
            medium_input_threshold: 50 * GIB,
            large_input_threshold: 100 * GIB,
            small_input_percent: 10,
            medium_input_percent: 5,
            large_input_percent: 2,
        }
    }
}

impl BufferSizingPolicy {
    /// Returns the buffer size to use for an input of `input_size` bytes.
    pub fn effective_buffer_size(&self, requested: u64, input_size: u64) -> u64 {
        let ceiling = self.ceiling(input_size);
        let size = requested.clamp(self.floor, ceiling);
        let size = round_to_power_of_two(size);

        log::debug!(
            "adjusted buffer size from {} to {} bytes (input: {} bytes, ceiling: {} bytes)",
            requested,
            size,
            input_size,
            ceiling
        );

        return size;
    }

    fn ceiling(&self, input_size: u64) -> u64 {
        let percent = if input_size < self.medium_input_threshold {
            self.small_input_percent
        } else if input_size < self.large_input_threshold {
            self.medium_input_percent
        } else {
            self.large_input_percent
        };

        let share = (u128::from(input_size) * u128::from(percent) / 100) as u64;
        share.clamp(self.floor, self.cap.max(self.floor))
    }
}

/// Number of runs a split with the given buffer is expected to produce.
pub fn estimate_run_count(input_size: u64, buffer_size: u64) -> u64 {
    input_size.div_ceil(buffer_size.max(1))
}

/// Read/write buffer size of a single stream: the buffer is shared by the streams a merge keeps open,
/// `fan_in` inputs and one output.
pub fn stream_buffer_size(buffer_size: u64, fan_in: usize) -> usize {
    let streams = fan_in.max(2) as u64 + 1;
    (buffer_size / streams).max(MIN_STREAM_BUFFER_SIZE) as usize
}

/// Write buffer size of a single partition writer: the buffer is shared by up to `partitions` writers
/// open at once.
pub fn partition_buffer_size(buffer_size: u64, partitions: usize) -> usize {
    (buffer_size / partitions.max(1) as u64).max(MIN_STREAM_BUFFER_SIZE) as usize
}

/// Record count at which an in-memory batch is flushed for the given memory budget.
pub fn batch_record_target(memory_budget: u64) -> usize {
    (memory_budget / AVERAGE_RECORD_SIZE).max(1) as usize
}

fn round_to_power_of_two(size: u64) -> u64 {
    if size <= 1 {
        return 1;
    }

    let upper = size.checked_next_power_of_two().unwrap_or(1 << 63);
    if upper == size {
        return size;
    }

    let lower = upper >> 1;
    if size - lower < upper - size {
        lower
    } else {
        upper
    }
}
