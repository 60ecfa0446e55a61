//! Page geometry for the tree file.
//!
//! The file is a flat run of pages addressed by byte offset; an offset is also
//! the identity of the page stored there. Three kinds of page exist:
//!
//! - Index pages (4KB by default) hold internal nodes
//! - Data pages (8KB by default) hold leaves
//! - Extend pages span a whole number of data pages and hold the overflow
//!   tail of one leaf
//!
//! Both fixed sizes are raised to the filesystem block size when it is larger.
//! The data page size is always a whole multiple of the index page size, so a
//! free data page can be carved into `rate` index pages and `rate` adjacent
//! index pages can be merged back into one data page.

use std::fs::File;
use std::io;

/// A byte position in the tree file.
pub type Offset = u64;

/// Sentinel offset meaning "no page".
pub const INVALID_OFFSET: Offset = 0xdead_beef;

/// Default index page size in bytes (4KB).
pub const DEFAULT_INDEX_PAGE_SIZE: u64 = 4096;

/// Default data page size in bytes (8KB).
pub const DEFAULT_DATA_PAGE_SIZE: u64 = 8192;

/// Page kinds as stored in the page record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// Internal node.
    Index = 1,
    /// Leaf node.
    Data = 2,
    /// Overflow tail of a leaf.
    Extend = 3,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Index),
            2 => Ok(Self::Data),
            3 => Ok(Self::Extend),
            _ => Err(value),
        }
    }
}

/// Page sizes for one open tree.
///
/// # Invariants
///
/// - `index_page_size > 0`
/// - `data_page_size` is a non-zero multiple of `index_page_size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    index_page_size: u64,
    data_page_size: u64,
}

impl PageGeometry {
    /// Build the geometry from configured sizes and the host block size.
    ///
    /// A `block_size` of 0 means "unknown" and leaves the configured sizes alone.
    #[must_use]
    pub fn new(index_page_size: u64, data_page_size: u64, block_size: u64) -> Self {
        let index_page_size = index_page_size.max(block_size).max(1);
        let data_page_size = data_page_size
            .max(block_size)
            .max(index_page_size)
            .next_multiple_of(index_page_size);

        Self {
            index_page_size,
            data_page_size,
        }
    }

    /// Index page size in bytes.
    #[must_use]
    pub const fn index_page_size(&self) -> u64 {
        self.index_page_size
    }

    /// Data page size in bytes.
    #[must_use]
    pub const fn data_page_size(&self) -> u64 {
        self.data_page_size
    }

    /// Number of index pages that fit in one data page.
    #[must_use]
    pub const fn rate(&self) -> u64 {
        self.data_page_size / self.index_page_size
    }

    /// Bytes occupied on disk by a page of the given type.
    ///
    /// `extend_pages` is the size of an Extend page in data pages; it is
    /// ignored for the other types.
    #[must_use]
    pub const fn footprint(&self, page_type: PageType, extend_pages: u64) -> u64 {
        match page_type {
            PageType::Index => self.index_page_size,
            PageType::Data => self.data_page_size,
            PageType::Extend => {
                let pages = if extend_pages == 0 { 1 } else { extend_pages };
                pages * self.data_page_size
            }
        }
    }

    /// Number of data pages an Extend page needs to hold `encoded_len` bytes.
    #[must_use]
    pub const fn extend_pages_for(&self, encoded_len: u64) -> u64 {
        let pages = encoded_len.div_ceil(self.data_page_size);
        if pages == 0 { 1 } else { pages }
    }

    /// Round `offset` up to the next index page boundary.
    #[must_use]
    pub const fn align_to_index_page(&self, offset: Offset) -> Offset {
        offset.next_multiple_of(self.index_page_size)
    }
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_PAGE_SIZE, DEFAULT_DATA_PAGE_SIZE, 0)
    }
}

/// Preferred I/O block size of the filesystem holding `file`.
///
/// Returns 0 where the platform does not report one.
#[cfg(unix)]
pub fn block_size(file: &File) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;

    Ok(file.metadata()?.blksize())
}

/// Preferred I/O block size of the filesystem holding `file`.
///
/// Returns 0 where the platform does not report one.
#[cfg(not(unix))]
pub fn block_size(file: &File) -> io::Result<u64> {
    file.metadata()?;
    Ok(0)
}
