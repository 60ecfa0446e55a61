//! Free-space allocator for index, data and extend pages.
//!
//! Free space is tracked as two offset-sorted lists, one per fixed page size.
//! A third, bounded staging list collects raw index-page-sized slots (from
//! growing the file or from recovery) until `adjust` sorts them into the typed
//! lists. Allocation and freeing move space between the two granularities:
//!
//! - An index allocation with no free index page carves one free data page
//!   into `rate` index slots.
//! - Freeing an index page promotes `rate` contiguous free index slots back
//!   into one data page.
//!
//! The allocator does no I/O. It tracks the logical file size; the caller
//! grows the physical file to match after each allocation.
//!
//! Whenever a slot changes granularity the allocator queues an inactive
//! marker for it, so the first record of every free entry always matches the
//! list it sits in: a Data marker at the lead slot of a free data page, an
//! Index marker (or zeroes) everywhere else. The caller drains the queue with
//! `take_pending_markers` and writes the markers.

// Free lists are bounded by the file size; offsets fit in usize on 64-bit targets.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{Offset, PageGeometry, PageType};

/// Default cap on the number of slots produced by one padding step.
pub const DEFAULT_MAX_FREE_BLOCKS: usize = 100;

/// Extend pages at least this many data pages long are always taken from the
/// end of the file rather than searched for in the free list.
pub const MAX_PADDED_EXTEND_PAGES: u64 = 255;

/// Page allocator over a single growable file.
///
/// # Invariants
///
/// - `free_index` and `free_data` are sorted and contain no duplicates
/// - every offset in either list lies below `file_size`
/// - `staging` is empty outside of `pad`/`adjust` and recovery
/// - once pending markers are written, every free data page starts with a
///   Data marker or zeroes, and every free index slot with an Index marker
///   or zeroes
#[derive(Debug)]
pub struct FreeSpaceAllocator {
    geometry: PageGeometry,
    /// Logical end of the file. Everything past it is unallocated.
    file_size: u64,
    /// Upper bound for padding steps.
    max_free_blocks: usize,
    /// Raw index-page-sized slots waiting to be sorted into the typed lists,
    /// flagged when their first bytes may hold a stale record.
    staging: Vec<(Offset, bool)>,
    free_index: Vec<Offset>,
    free_data: Vec<Offset>,
    /// Markers to write before the next scan can trust the free slots.
    pending_markers: Vec<(Offset, PageType)>,
}

impl FreeSpaceAllocator {
    /// Create an allocator for a file currently `file_size` bytes long with
    /// no known free pages.
    #[must_use]
    pub fn new(geometry: PageGeometry, file_size: u64, max_free_blocks: usize) -> Self {
        Self {
            geometry,
            file_size,
            max_free_blocks: max_free_blocks.max(2),
            staging: Vec::new(),
            free_index: Vec::new(),
            free_data: Vec::new(),
            pending_markers: Vec::new(),
        }
    }

    /// Logical file size in bytes.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Free index page offsets, sorted.
    #[must_use]
    pub fn free_index_pages(&self) -> &[Offset] {
        &self.free_index
    }

    /// Free data page offsets, sorted.
    #[must_use]
    pub fn free_data_pages(&self) -> &[Offset] {
        &self.free_data
    }

    /// Take an index page.
    pub fn alloc_index_page(&mut self) -> Offset {
        if self.free_index.is_empty() && self.free_data.is_empty() {
            self.pad(self.max_free_blocks / 2);
        }
        if !self.free_index.is_empty() {
            return self.free_index.remove(0);
        }

        let block = self.take_data_page();
        let index_page_size = self.geometry.index_page_size();
        for slot in 1..self.geometry.rate() {
            let offset = block + slot * index_page_size;
            insert_sorted(&mut self.free_index, offset);
            self.pending_markers.push((offset, PageType::Index));
        }
        tracing::trace!("carved data page {block} into {} index pages", self.geometry.rate());
        block
    }

    /// Take a data page.
    pub fn alloc_data_page(&mut self) -> Offset {
        self.take_data_page()
    }

    /// Take `pages` contiguous data pages for an Extend page.
    pub fn alloc_extend_pages(&mut self, pages: u64) -> Offset {
        if pages <= 1 {
            return self.take_data_page();
        }

        if pages < MAX_PADDED_EXTEND_PAGES {
            if let Some(offset) = self.take_contiguous_data(pages) {
                return offset;
            }
            self.pad(2 * pages as usize);
            if let Some(offset) = self.take_contiguous_data(pages) {
                return offset;
            }
        }

        self.grow(pages * self.geometry.data_page_size())
    }

    /// Return an index page to the free list.
    ///
    /// If this completes a run of `rate` contiguous free index pages, the run
    /// is promoted into a single free data page.
    pub fn free_index_page(&mut self, offset: Offset) {
        if !insert_sorted(&mut self.free_index, offset) {
            tracing::warn!("index page {offset} freed twice");
            return;
        }
        self.promote_index_run(offset);
    }

    /// Return a data page to the free list.
    pub fn free_data_page(&mut self, offset: Offset) {
        if !insert_sorted(&mut self.free_data, offset) {
            tracing::warn!("data page {offset} freed twice");
        }
    }

    /// Return an Extend page spanning `pages` data pages to the free list.
    pub fn free_extend_pages(&mut self, offset: Offset, pages: u64) {
        let data_page_size = self.geometry.data_page_size();
        for page in 0..pages.max(1) {
            self.free_data_page(offset + page * data_page_size);
        }
    }

    /// Add a raw index-page-sized slot found in the file to the staging list.
    ///
    /// Used by recovery; the staging list is not bounded here. The slot may
    /// hold any stale record, so it is re-marked once sorted.
    pub fn stage(&mut self, offset: Offset) {
        self.staging.push((offset, true));
    }

    /// Drain the markers that still need writing.
    ///
    /// Markers for slots that were handed out again since they were queued
    /// are dropped, as are Index markers that would land on the lead slot of
    /// a free data page.
    pub fn take_pending_markers(&mut self) -> Vec<(Offset, PageType)> {
        let mut pending = std::mem::take(&mut self.pending_markers);
        pending.retain(|&(offset, page_type)| match page_type {
            PageType::Data => self.free_data.binary_search(&offset).is_ok(),
            PageType::Index => {
                self.free_index.binary_search(&offset).is_ok() || self.inside_free_data(offset)
            }
            PageType::Extend => false,
        });
        pending
    }

    /// Grow the staging list up to `limit` slots from the end of the file and
    /// sort everything staged into the typed lists.
    ///
    /// Growth is skipped when more than `limit / 2` data pages are already
    /// free.
    pub fn pad(&mut self, limit: usize) {
        let limit = limit.max(self.geometry.rate() as usize);
        if self.free_data.len() <= limit / 2 {
            let index_page_size = self.geometry.index_page_size();
            let mut next = self.geometry.align_to_index_page(self.file_size);
            let before = self.staging.len();
            while self.staging.len() < limit {
                self.staging.push((next, false));
                next += index_page_size;
            }
            self.file_size = self.file_size.max(next);
            tracing::trace!(
                "padded {} index slots, file size now {}",
                self.staging.len() - before,
                self.file_size
            );
        }
        self.adjust();
    }

    /// Sort the staging list into the typed free lists.
    ///
    /// Each run of `rate` contiguous slots becomes one data page; slots left
    /// over at the end of a run become index pages. Stale slots get markers
    /// for their new granularity.
    pub fn adjust(&mut self) {
        let mut staged = std::mem::take(&mut self.staging);
        staged.sort_unstable_by_key(|&(offset, _)| offset);
        staged.dedup_by(|later, kept| {
            if later.0 == kept.0 {
                kept.1 |= later.1;
                true
            } else {
                false
            }
        });

        let rate = self.geometry.rate() as usize;
        let index_page_size = self.geometry.index_page_size();
        let mut start = 0;
        while start < staged.len() {
            let mut run = 1;
            while start + run < staged.len()
                && staged[start + run].0 == staged[start + run - 1].0 + index_page_size
            {
                run += 1;
            }

            let whole = run / rate * rate;
            for group in staged[start..start + whole].chunks(rate) {
                let block = group[0].0;
                insert_sorted(&mut self.free_data, block);
                if group.iter().any(|&(_, stale)| stale) {
                    self.pending_markers.push((block, PageType::Data));
                    for &(slot, stale) in &group[1..] {
                        if stale {
                            self.pending_markers.push((slot, PageType::Index));
                        }
                    }
                }
            }
            for &(slot, stale) in &staged[start + whole..start + run] {
                if stale {
                    self.pending_markers.push((slot, PageType::Index));
                }
                self.free_index_page(slot);
            }
            start += run;
        }
    }

    fn take_data_page(&mut self) -> Offset {
        if self.free_data.is_empty() {
            self.pad(self.max_free_blocks / 2);
        }
        if self.free_data.is_empty() {
            return self.grow(self.geometry.data_page_size());
        }
        self.free_data.remove(0)
    }

    fn take_contiguous_data(&mut self, pages: u64) -> Option<Offset> {
        let span = (pages - 1) * self.geometry.data_page_size();
        let count = pages as usize;
        let start = self
            .free_data
            .windows(count)
            .position(|run| run[count - 1] - run[0] == span)?;
        let offset = self.free_data[start];
        self.free_data.drain(start..start + count);
        Some(offset)
    }

    fn promote_index_run(&mut self, offset: Offset) {
        let rate = self.geometry.rate() as usize;
        let index_page_size = self.geometry.index_page_size();
        let span = (rate as u64 - 1) * index_page_size;
        let Ok(position) = self.free_index.binary_search(&offset) else {
            return;
        };

        let first = position.saturating_sub(rate - 1);
        let last = position.min(self.free_index.len().saturating_sub(rate));
        for start in first..=last {
            let Some(run) = self.free_index.get(start..start + rate) else {
                continue;
            };
            if run[rate - 1] - run[0] == span {
                let block = run[0];
                self.free_index.drain(start..start + rate);
                insert_sorted(&mut self.free_data, block);
                self.pending_markers.push((block, PageType::Data));
                tracing::trace!("promoted index run at {block} into a data page");
                return;
            }
        }
    }

    /// Whether `offset` is a non-leading slot of a free data page.
    fn inside_free_data(&self, offset: Offset) -> bool {
        let position = self.free_data.partition_point(|&block| block < offset);
        position > 0 && offset < self.free_data[position - 1] + self.geometry.data_page_size()
    }

    /// Extend the logical file by `len` bytes, returning the old end
    /// rounded to an index page boundary.
    fn grow(&mut self, len: u64) -> Offset {
        let offset = self.geometry.align_to_index_page(self.file_size);
        self.file_size = offset + len;
        tracing::trace!("grew file to {} bytes", self.file_size);
        offset
    }
}

/// Insert `offset` keeping `list` sorted. Returns false if it was present.
fn insert_sorted(list: &mut Vec<Offset>, offset: Offset) -> bool {
    match list.binary_search(&offset) {
        Ok(_) => false,
        Err(position) => {
            list.insert(position, offset);
            true
        }
    }
}
