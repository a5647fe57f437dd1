//! Strategies for splitting a flat list of tests into buckets.
//!
//! Every strategy first cuts the input into maximal consecutive runs of tests sharing one
//! configuration, then splits each run on its own. Concatenating the resulting buckets in order
//! always gives back the input.

use tdq_utils::{
    id_generator::{SharedIdGenerator, UniqueIdGenerator},
    net_protocol::{
        ids::BucketId,
        models::{Bucket, TestConfiguration, TestEntry, TestEntryConfiguration},
        queue::ScheduleStrategy,
    },
};
use thiserror::Error;

/// What a strategy knows about the fleet it splits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSplitInfo {
    pub number_of_workers: usize,
}

impl BucketSplitInfo {
    pub fn new(number_of_workers: usize) -> Self {
        Self {
            number_of_workers: number_of_workers.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("fixed bucket size must be at least 1")]
    ZeroBucketSize,
}

pub trait BucketSplitter: Send + Sync {
    /// Splits tests that share one configuration into the tests of each bucket, keeping order.
    fn split(
        &self,
        entries: Vec<TestEntry>,
        info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndividualSplitter;

#[derive(Debug, Clone, Copy, Default)]
pub struct EquallyDividedSplitter;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressiveSplitter;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsplitSplitter;

#[derive(Debug, Clone, Copy)]
pub struct FixedBucketSizeSplitter {
    pub size: usize,
}

impl BucketSplitter for IndividualSplitter {
    fn split(
        &self,
        entries: Vec<TestEntry>,
        _info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError> {
        Ok(entries.into_iter().map(|entry| vec![entry]).collect())
    }
}

impl BucketSplitter for EquallyDividedSplitter {
    fn split(
        &self,
        entries: Vec<TestEntry>,
        info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError> {
        Ok(split_evenly(entries, info.number_of_workers))
    }
}

/// Percentages of the input making up each chunk. Whatever is left forms a final chunk.
const PROGRESSIVE_CHUNKS: [usize; 4] = [40, 20, 20, 10];

impl BucketSplitter for ProgressiveSplitter {
    fn split(
        &self,
        entries: Vec<TestEntry>,
        info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError> {
        let total = entries.len();
        let mut rest = entries.into_iter();
        let mut remaining = total;
        let mut buckets = Vec::new();

        let chunk_sizes = PROGRESSIVE_CHUNKS
            .iter()
            .map(|percent| (total * percent + 99) / 100);
        for size in chunk_sizes {
            let size = size.min(remaining);
            remaining -= size;
            let chunk: Vec<_> = rest.by_ref().take(size).collect();
            buckets.extend(split_evenly(chunk, info.number_of_workers));
        }
        buckets.extend(split_evenly(rest.collect(), info.number_of_workers));

        Ok(buckets)
    }
}

impl BucketSplitter for UnsplitSplitter {
    fn split(
        &self,
        entries: Vec<TestEntry>,
        _info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError> {
        if entries.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![entries])
    }
}

impl BucketSplitter for FixedBucketSizeSplitter {
    fn split(
        &self,
        entries: Vec<TestEntry>,
        _info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError> {
        if self.size == 0 {
            return Err(SplitError::ZeroBucketSize);
        }
        Ok(entries.chunks(self.size).map(<[_]>::to_vec).collect())
    }
}

impl BucketSplitter for ScheduleStrategy {
    fn split(
        &self,
        entries: Vec<TestEntry>,
        info: &BucketSplitInfo,
    ) -> Result<Vec<Vec<TestEntry>>, SplitError> {
        match *self {
            ScheduleStrategy::Individual => IndividualSplitter.split(entries, info),
            ScheduleStrategy::EquallyDivided => EquallyDividedSplitter.split(entries, info),
            ScheduleStrategy::Progressive => ProgressiveSplitter.split(entries, info),
            ScheduleStrategy::Unsplit => UnsplitSplitter.split(entries, info),
            ScheduleStrategy::FixedBucketSize { size } => {
                FixedBucketSizeSplitter { size }.split(entries, info)
            }
        }
    }
}

/// Splits into at most `parts` non-empty, contiguous groups whose sizes differ by at most one;
/// larger groups come first.
fn split_evenly(entries: Vec<TestEntry>, parts: usize) -> Vec<Vec<TestEntry>> {
    let len = entries.len();
    let parts = parts.clamp(1, len.max(1));
    if len == 0 {
        return vec![];
    }

    let base = len / parts;
    let larger = len % parts;
    let mut rest = entries.into_iter();
    (0..parts)
        .map(|i| {
            let size = if i < larger { base + 1 } else { base };
            rest.by_ref().take(size).collect()
        })
        .collect()
}

/// Cuts `entries` into maximal consecutive runs sharing a configuration.
fn group_by_configuration(
    entries: Vec<TestEntryConfiguration>,
) -> Vec<(TestConfiguration, Vec<TestEntry>)> {
    let mut groups: Vec<(TestConfiguration, Vec<TestEntry>)> = Vec::new();
    for TestEntryConfiguration {
        test_entry,
        configuration,
    } in entries
    {
        match groups.last_mut() {
            Some((current, tests)) if *current == configuration => tests.push(test_entry),
            _ => groups.push((configuration, vec![test_entry])),
        }
    }
    groups
}

/// Splits `entries` into buckets with fresh ids from `id_generator`.
pub fn split_into_buckets(
    splitter: &dyn BucketSplitter,
    entries: Vec<TestEntryConfiguration>,
    info: &BucketSplitInfo,
    id_generator: &SharedIdGenerator,
) -> Result<Vec<Bucket>, SplitError> {
    let mut buckets = Vec::new();
    for (configuration, tests) in group_by_configuration(entries) {
        for bucket_entries in splitter.split(tests, info)? {
            if bucket_entries.is_empty() {
                continue;
            }
            buckets.push(Bucket::new(
                BucketId::new(id_generator.generate()),
                bucket_entries,
                configuration.clone(),
            ));
        }
    }
    Ok(buckets)
}
