use std::ops::{Bound, RangeBounds};

use crate::error::Result;
use crate::types::{Entry, Key};

/// A generic adapter that restricts a sorted entry stream to a key range.
/// Terminates early once a key beyond the end bound appears, so wrapping a
/// lazy source stays lazy.
pub struct RangeFilter<I, R>
where
    I: Iterator<Item = Result<(Key, Entry)>>,
    R: RangeBounds<Vec<u8>>,
{
    inner: I,
    range: R,
}

impl<I, R> RangeFilter<I, R>
where
    I: Iterator<Item = Result<(Key, Entry)>>,
    R: RangeBounds<Vec<u8>>,
{
    pub fn new(inner: I, range: R) -> Self {
        Self { inner, range }
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match self.range.start_bound() {
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn beyond_end(&self, key: &[u8]) -> bool {
        match self.range.end_bound() {
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl<I, R> Iterator for RangeFilter<I, R>
where
    I: Iterator<Item = Result<(Key, Entry)>>,
    R: RangeBounds<Vec<u8>>,
{
    type Item = Result<(Key, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((key, entry)) => {
                    if self.beyond_end(&key) {
                        return None;
                    }
                    if !self.before_start(&key) {
                        return Some(Ok((key, entry)));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
