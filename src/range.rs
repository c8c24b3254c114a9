use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt};

/// Range where lower bound is inclusive, upper bound is exclusive or unbounded.
///
/// Used for bucketing values, see [`ValidRange`] for plausibility filtering.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Range<T>(T, Option<T>);

impl<T> Range<T>
where
    T: Ord,
{
    pub fn new(from: T, to: Option<T>) -> Self {
        if let Some(ref to) = to {
            if from >= *to {
                panic!("ranges must go from low to high")
            }
        }
        Range(from, to)
    }

    pub fn contains(&self, val: &T) -> bool {
        if let Some(end) = &self.1 {
            val >= &self.0 && val < end
        } else {
            val >= &self.0
        }
    }
}

impl<T> Range<T> {
    pub fn start(&self) -> &T {
        &self.0
    }

    /// `None` means the range is unbounded above.
    pub fn end(&self) -> Option<&T> {
        self.1.as_ref()
    }
}

impl<T> fmt::Display for Range<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(end) = &self.1 {
            write!(f, "{:.2} - {:.2}", self.0, end)
        } else {
            write!(f, "{:.2}+", self.0)
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RangeSet<T> {
    ranges: Vec<Range<T>>,
}

impl<T> RangeSet<T> {
    pub fn new(ranges: Vec<Range<T>>) -> Self {
        Self { ranges }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<T>> + '_ {
        self.ranges.iter()
    }

    pub fn push(&mut self, range: Range<T>) {
        self.ranges.push(range);
    }
}

impl<T> RangeSet<T>
where
    T: Ord,
{
    pub fn bucket_values<I, B>(self, values: I) -> RangeSetCounts<T>
    where
        I: Iterator<Item = B>,
        B: Borrow<T>,
    {
        let mut buckets = vec![0usize; self.ranges.len()];
        for value in values {
            for (idx, bucket) in self.ranges.iter().enumerate() {
                if bucket.contains(value.borrow()) {
                    buckets[idx] += 1;
                }
            }
        }
        RangeSetCounts {
            set: self,
            counts: buckets,
        }
    }
}

/// A range set with values bucketed, and bucket sizes recorded.
pub struct RangeSetCounts<T> {
    set: RangeSet<T>,
    counts: Vec<usize>,
}

impl<T> RangeSetCounts<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&Range<T>, usize)> {
        self.set.iter().zip_eq(self.counts.iter().copied())
    }
}

/// A plausibility window for measured values. Both bounds are exclusive.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub low: f64,
    pub high: f64,
}

impl ValidRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low < value && value < self.high
    }
}

impl fmt::Display for ValidRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}
