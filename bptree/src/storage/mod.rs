//! Page-level storage beneath the tree.
//!
//! # File Format
//!
//! The tree lives in a single file with no header. Space is carved into
//! pages of three kinds:
//!
//! - Index pages (`index_page_size`, default 4KB): internal nodes
//! - Data pages (`data_page_size`, default 8KB, a multiple of the index page): leaves
//! - Extend pages (a run of data pages): overflow tails of large leaves
//!
//! Each page starts with a little-endian `u64` length followed by the node
//! record. A zero length marks a slot that was never written.

pub mod allocator;
pub mod file;
pub mod page;

pub use allocator::FreeSpaceAllocator;
pub use file::{FileError, TreeFile};
pub use page::{INVALID_OFFSET, Offset, PageGeometry, PageType};
