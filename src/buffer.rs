//! In-memory record buffers.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::mem;

use rayon::slice::ParallelSliceMut;

use crate::record::{total_cmp, CompareFn, LineRecord};

/// Line buffer builder.
#[derive(Debug, Clone)]
pub struct LineBufferBuilder {
    record_limit: usize,
    byte_limit: usize,
    preallocate: bool,
}

impl LineBufferBuilder {
    /// # Arguments
    /// * `record_limit` - Number of records after which the buffer is full
    /// * `byte_limit` - Memory (line bytes and record slots) after which the buffer is full
    /// * `preallocate` - Whether record slots are allocated upfront
    pub fn new(record_limit: usize, byte_limit: usize, preallocate: bool) -> Self {
        LineBufferBuilder {
            record_limit: record_limit.max(1),
            byte_limit,
            preallocate,
        }
    }

    pub fn build(&self) -> LineBuffer {
        let slots = if self.preallocate {
            Vec::with_capacity(self.record_limit.min(self.byte_limit / mem::size_of::<Slot>()))
        } else {
            Vec::new()
        };

        LineBuffer {
            data: Vec::new(),
            slots,
            record_limit: self.record_limit,
            byte_limit: self.byte_limit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    start: usize,
    end: usize,
    key_offset: usize,
    number: u64,
}

impl Slot {
    fn record<'a>(&self, data: &'a [u8]) -> LineRecord<'a> {
        LineRecord::from_parts(&data[self.start..self.end], self.key_offset, self.number)
    }
}

/// Batch of lines limited by record count and memory.
///
/// Line bytes are copied into a single arena, records are slots pointing into it. Records handed out by
/// [`LineBuffer::records`] borrow the arena, so the buffer cannot be cleared while they are alive.
#[derive(Debug)]
pub struct LineBuffer {
    data: Vec<u8>,
    slots: Vec<Slot>,
    record_limit: usize,
    byte_limit: usize,
}

impl LineBuffer {
    /// Adds a record to the buffer.
    pub fn push(&mut self, record: &LineRecord<'_>) {
        let start = self.data.len();
        self.data.extend_from_slice(record.raw());
        self.slots.push(Slot {
            start,
            end: self.data.len(),
            key_offset: record.key_offset(),
            number: record.number(),
        });
    }

    /// Returns buffer length.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Memory used by line bytes and record slots.
    pub fn mem_size(&self) -> usize {
        self.data.len() + self.slots.len() * mem::size_of::<Slot>()
    }

    /// Checks if the buffer reached one of its limits.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.record_limit || self.mem_size() >= self.byte_limit
    }

    /// Sorts buffered records in parallel using the current rayon pool.
    pub fn sort_by(&mut self, compare: CompareFn) {
        let data = &self.data;
        self.slots
            .par_sort_unstable_by(|a, b| total_cmp(compare, &a.record(data), &b.record(data)));
    }

    /// Iterates over buffered records in their current order.
    pub fn records(&self) -> impl Iterator<Item = LineRecord<'_>> + '_ {
        self.slots.iter().map(move |slot| slot.record(&self.data))
    }

    /// Empties the buffer keeping allocated memory.
    pub fn clear(&mut self) {
        self.data.clear();
        self.slots.clear();
    }
}

/// Owned copy of a parsed line.
#[derive(Debug)]
struct OwnedRecord {
    line: Box<[u8]>,
    key_offset: usize,
    number: u64,
}

impl OwnedRecord {
    fn new(record: &LineRecord<'_>) -> Self {
        OwnedRecord {
            line: record.raw().into(),
            key_offset: record.key_offset(),
            number: record.number(),
        }
    }

    fn record(&self) -> LineRecord<'_> {
        LineRecord::from_parts(&self.line, self.key_offset, self.number)
    }

    fn mem_size(&self) -> usize {
        self.line.len() + mem::size_of::<TaggedRecord>()
    }
}

struct TaggedRecord {
    run: u64,
    record: OwnedRecord,
    compare: CompareFn,
}

impl PartialEq for TaggedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TaggedRecord {}

impl PartialOrd for TaggedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaggedRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.run
            .cmp(&other.run)
            .then_with(|| total_cmp(self.compare, &self.record.record(), &other.record.record()))
    }
}

/// Replacement selection heap.
///
/// Every record is tagged with the run it belongs to: records not smaller than the last emitted one join the
/// current run, smaller ones are deferred to the next run. Popping yields records of the current run in order
/// and moves to the next run once the current one is drained, so runs grow beyond the memory limit when the
/// input is partially ordered.
pub struct SelectionHeap {
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    heap: BinaryHeap<Reverse<TaggedRecord>>,
    compare: CompareFn,
    byte_limit: usize,
    used: usize,
    current_run: u64,
    last: Option<OwnedRecord>,
}

impl SelectionHeap {
    pub fn new(byte_limit: usize, compare: CompareFn) -> Self {
        SelectionHeap {
            heap: BinaryHeap::new(),
            compare,
            byte_limit,
            used: 0,
            current_run: 0,
            last: None,
        }
    }

    /// Adds a record tagging it with the run it belongs to.
    pub fn push(&mut self, record: &LineRecord<'_>) {
        let deferred = match &self.last {
            Some(last) => total_cmp(self.compare, record, &last.record()) == Ordering::Less,
            None => false,
        };
        let run = if deferred { self.current_run + 1 } else { self.current_run };

        let record = OwnedRecord::new(record);
        self.used += record.mem_size();
        self.heap.push(Reverse(TaggedRecord {
            run,
            record,
            compare: self.compare,
        }));
    }

    /// Removes the smallest record of the lowest run.
    /// Returns the run the record belongs to and the record line.
    pub fn pop(&mut self) -> Option<(u64, &[u8])> {
        let Reverse(tagged) = self.heap.pop()?;
        self.used -= tagged.record.mem_size();
        self.current_run = tagged.run;

        let last = self.last.insert(tagged.record);
        return Some((self.current_run, &last.line[..]));
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.byte_limit
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
