// SPDX-License-Identifier: Apache-2.0

//! One bit per heap page

use core::sync::atomic::{AtomicU64, Ordering};

use lset::Line;
use primordial::Page;

use crate::{Error, Result};

const BITS: usize = u64::BITS as usize;

/// A page bitmap over the heap, backed by atomic words owned by the caller
#[derive(Debug)]
pub struct Bitmap<'a> {
    words: &'a [AtomicU64],
    line: Line<usize>,
}

impl<'a> Bitmap<'a> {
    /// Number of words needed to track `pages` pages
    #[inline]
    pub const fn words(pages: usize) -> usize {
        (pages + BITS - 1) / BITS
    }

    /// Create a bitmap tracking the pages of `line`.
    ///
    /// Fails if `words` is too small for the range.
    pub fn new(words: &'a [AtomicU64], line: Line<usize>) -> Result<Self> {
        let pages = line.end.saturating_sub(line.start) / Page::SIZE;

        if words.len() < Self::words(pages) {
            return Err(Error::InvalidArgument);
        }

        Ok(Self { words, line })
    }

    /// Clear all bits.
    pub fn reset(&self) {
        for word in self.words {
            word.store(0, Ordering::Release);
        }
    }

    #[inline]
    fn position(&self, addr: usize) -> Option<(usize, u64)> {
        if addr < self.line.start || addr >= self.line.end {
            return None;
        }

        let page = (addr - self.line.start) / Page::SIZE;
        Some((page / BITS, 1 << (page % BITS)))
    }

    /// Whether the bit of the page containing `addr` is set
    #[inline]
    pub fn is_set(&self, addr: usize) -> bool {
        match self.position(addr) {
            Some((word, mask)) => self.words[word].load(Ordering::Acquire) & mask != 0,
            None => false,
        }
    }

    /// Set the bit of the page containing `addr`, returning the previous state.
    #[inline]
    pub fn set(&self, addr: usize) -> bool {
        match self.position(addr) {
            Some((word, mask)) => self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0,
            None => false,
        }
    }

    /// Clear the bit of the page containing `addr`, returning the previous state.
    #[inline]
    pub fn clear(&self, addr: usize) -> bool {
        match self.position(addr) {
            Some((word, mask)) => self.words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0,
            None => false,
        }
    }

    /// Set the bits of all pages in `line`.
    pub fn set_range(&self, line: Line<usize>) {
        for addr in (line.start..line.end).step_by(Page::SIZE) {
            self.set(addr);
        }
    }

    /// Clear the bits of all pages in `line`.
    pub fn clear_range(&self, line: Line<usize>) {
        for addr in (line.start..line.end).step_by(Page::SIZE) {
            self.clear(addr);
        }
    }

    /// Iterate over the maximal runs of set bits within `line`.
    pub fn runs(&self, line: Line<usize>) -> Runs<'_, 'a> {
        Runs {
            bitmap: self,
            cursor: line.start,
            end: line.end,
        }
    }

    /// Number of set bits within `line`
    pub fn count(&self, line: Line<usize>) -> usize {
        self.runs(line)
            .map(|run| (run.end - run.start) / Page::SIZE)
            .sum()
    }
}

/// Iterator over runs of set bits, see [`Bitmap::runs`]
pub struct Runs<'b, 'a> {
    bitmap: &'b Bitmap<'a>,
    cursor: usize,
    end: usize,
}

impl Iterator for Runs<'_, '_> {
    type Item = Line<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.end && !self.bitmap.is_set(self.cursor) {
            self.cursor += Page::SIZE;
        }

        if self.cursor >= self.end {
            return None;
        }

        let start = self.cursor;
        while self.cursor < self.end && self.bitmap.is_set(self.cursor) {
            self.cursor += Page::SIZE;
        }

        Some(Line::new(start, self.cursor))
    }
}
