//! B+Tree node model and page record codec.
//!
//! Every page holds exactly one length-prefixed record:
//!
//! ```text
//! +---------+--------+------+----------+----------+------+------+------+--------+
//! | dataLen | active | type | nChild   | children | self | next | prev | parent |
//! | u64     | u8     | u8   | u8       | u64 * n  | u64  | u64  | u64  | u64    |
//! +---------+--------+------+----------+----------+------+------+------+--------+
//! | isLeaf  | extend | nKey | keys     | nRecord  | records                      |
//! | u8      | u64    | u8   | u64 * n  | u8       | (len + bytes) * n            |
//! +---------+--------+------+----------+----------+------------------------------+
//! ```
//!
//! All integers are little-endian and `dataLen` counts the bytes after itself.
//! A record's length field is one byte on Index and Data pages and four bytes
//! on Extend pages, which carry the part of a leaf that does not fit in its
//! data page.

// Counts and record lengths are bounds-checked before they are narrowed.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{INVALID_OFFSET, Offset, PageType};

/// Size of the `dataLen` prefix.
pub const LEN_PREFIX_SIZE: usize = 8;

/// Fixed body bytes: active, type, three counts, four offsets, `isLeaf`, extend.
pub const FIXED_BODY_SIZE: usize = 1 + 1 + 1 + 4 * 8 + 1 + 8 + 1 + 1;

/// Largest count representable in a record.
pub const MAX_ENTRIES: usize = u8::MAX as usize;

/// Largest record that can be stored on a primary (Index or Data) page.
pub const MAX_INLINE_RECORD_LEN: usize = u8::MAX as usize;

/// In-memory form of one page.
///
/// For a leaf with a chained Extend page, `keys` and `records` hold the whole
/// logical leaf; the split between the data page and the Extend page is
/// recomputed on every flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub active: bool,
    pub page_type: PageType,
    /// Child offsets (index nodes only), aligned with `keys`.
    pub children: Vec<Offset>,
    pub self_offset: Offset,
    pub next: Offset,
    pub prev: Offset,
    pub parent: Offset,
    pub is_leaf: bool,
    /// Chained Extend page, or `INVALID_OFFSET`.
    pub extend_page: Offset,
    /// Ascending keys. In an index node `keys[i]` is the largest key under `children[i]`.
    pub keys: Vec<u64>,
    /// Values (leaves only), aligned with `keys`.
    pub records: Vec<Vec<u8>>,
    /// Size of `extend_page` in data pages; not persisted.
    pub extend_pages: u64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            active: false,
            page_type: PageType::Data,
            children: Vec::new(),
            self_offset: INVALID_OFFSET,
            next: INVALID_OFFSET,
            prev: INVALID_OFFSET,
            parent: INVALID_OFFSET,
            is_leaf: false,
            extend_page: INVALID_OFFSET,
            keys: Vec::new(),
            records: Vec::new(),
            extend_pages: 0,
        }
    }
}

impl Node {
    /// Reset to a fresh node, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.active = false;
        self.page_type = PageType::Data;
        self.children.clear();
        self.self_offset = INVALID_OFFSET;
        self.next = INVALID_OFFSET;
        self.prev = INVALID_OFFSET;
        self.parent = INVALID_OFFSET;
        self.is_leaf = false;
        self.extend_page = INVALID_OFFSET;
        self.keys.clear();
        self.records.clear();
        self.extend_pages = 0;
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the node holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Largest key in the node.
    #[must_use]
    pub fn max_key(&self) -> Option<u64> {
        self.keys.last().copied()
    }

    /// Locate `key`: `Ok(i)` if present, `Err(i)` with its insert position otherwise.
    pub fn search(&self, key: u64) -> Result<usize, usize> {
        self.keys.binary_search(&key)
    }

    /// Index of the child to descend into for `key`.
    ///
    /// The first child whose maximum is at least `key`, or the last child when
    /// `key` is larger than everything in the node.
    #[must_use]
    pub fn child_index_for(&self, key: u64) -> usize {
        let index = self.keys.partition_point(|&k| k < key);
        index.min(self.keys.len().saturating_sub(1))
    }

    /// Position of `child` among this node's children.
    #[must_use]
    pub fn position_of_child(&self, child: Offset) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }

    /// Move entries `at..` into `right`, which must be empty.
    pub fn split_into(&mut self, right: &mut Self, at: usize) {
        right.keys.extend(self.keys.drain(at..));
        if self.is_leaf {
            right.records.extend(self.records.drain(at..));
        } else {
            right.children.extend(self.children.drain(at..));
        }
    }

    /// Append all of `right`'s entries to this node, leaving `right` empty.
    pub fn absorb(&mut self, right: &mut Self) {
        self.keys.append(&mut right.keys);
        self.records.append(&mut right.records);
        self.children.append(&mut right.children);
    }

    /// Set up `self` as an inactive record for the page at `offset`.
    pub fn mark_inactive(&mut self, page_type: PageType, offset: Offset) {
        self.reset();
        self.page_type = page_type;
        self.self_offset = offset;
    }

    /// Encoded size in bytes, including the length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let width = record_len_width(self.page_type);
        LEN_PREFIX_SIZE
            + FIXED_BODY_SIZE
            + 8 * self.children.len()
            + 8 * self.keys.len()
            + self.records.iter().map(|r| width + r.len()).sum::<usize>()
    }

    /// Encode into a buffer of at most `capacity` bytes.
    ///
    /// The extend pointer is written as is; splitting a large leaf across an
    /// Extend page is the caller's job.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>, PageOverflow> {
        if !self.fits(capacity) {
            return Err(PageOverflow);
        }

        let width = record_len_width(self.page_type);
        let total = self.encoded_len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&((total - LEN_PREFIX_SIZE) as u64).to_le_bytes());
        buf.push(u8::from(self.active));
        buf.push(self.page_type as u8);
        buf.push(self.children.len() as u8);
        for child in &self.children {
            buf.extend_from_slice(&child.to_le_bytes());
        }
        for offset in [self.self_offset, self.next, self.prev, self.parent] {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        buf.push(u8::from(self.is_leaf));
        buf.extend_from_slice(&self.extend_page.to_le_bytes());
        buf.push(self.keys.len() as u8);
        for key in &self.keys {
            buf.extend_from_slice(&key.to_le_bytes());
        }
        buf.push(self.records.len() as u8);
        for record in &self.records {
            if width == 1 {
                buf.push(record.len() as u8);
            } else {
                buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
            }
            buf.extend_from_slice(record);
        }
        Ok(buf)
    }

    /// Whether the node can be encoded into `capacity` bytes.
    #[must_use]
    pub fn fits(&self, capacity: usize) -> bool {
        let max_record = if self.page_type == PageType::Extend {
            u32::MAX as usize
        } else {
            MAX_INLINE_RECORD_LEN
        };
        self.children.len() <= MAX_ENTRIES
            && self.keys.len() <= MAX_ENTRIES
            && self.records.len() <= MAX_ENTRIES
            && self.records.iter().all(|r| r.len() <= max_record)
            && self.encoded_len() <= capacity
    }

    /// Decode a record body (the bytes after `dataLen`) into `self`.
    ///
    /// Replaces every field. The chained Extend page, if any, is not followed.
    pub fn decode(&mut self, body: &[u8]) -> Result<(), NodeError> {
        self.reset();
        let mut reader = Reader::new(body);

        self.active = reader.read_u8()? != 0;
        let raw_type = reader.read_u8()?;
        self.page_type = PageType::try_from(raw_type).map_err(NodeError::InvalidPageType)?;

        let child_count = reader.read_u8()?;
        for _ in 0..child_count {
            self.children.push(reader.read_u64()?);
        }

        self.self_offset = reader.read_u64()?;
        self.next = reader.read_u64()?;
        self.prev = reader.read_u64()?;
        self.parent = reader.read_u64()?;
        self.is_leaf = reader.read_u8()? != 0;
        self.extend_page = reader.read_u64()?;

        let key_count = reader.read_u8()?;
        for _ in 0..key_count {
            self.keys.push(reader.read_u64()?);
        }

        let record_count = reader.read_u8()?;
        let wide = self.page_type == PageType::Extend;
        for _ in 0..record_count {
            let len = if wide {
                reader.read_u32()? as usize
            } else {
                usize::from(reader.read_u8()?)
            };
            self.records.push(reader.read_bytes(len)?.to_vec());
        }

        if self.is_leaf && self.records.len() != self.keys.len() {
            return Err(NodeError::Misaligned {
                keys: self.keys.len(),
                entries: self.records.len(),
            });
        }
        if !self.is_leaf && self.page_type == PageType::Index && self.children.len() != self.keys.len() {
            return Err(NodeError::Misaligned {
                keys: self.keys.len(),
                entries: self.children.len(),
            });
        }
        Ok(())
    }
}

const fn record_len_width(page_type: PageType) -> usize {
    match page_type {
        PageType::Extend => 4,
        PageType::Index | PageType::Data => 1,
    }
}

/// The encoded node does not fit in the page it is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOverflow;

/// Little-endian cursor over a record body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(NodeError::Truncated {
                needed: self.pos.saturating_add(len),
                available: self.buf.len(),
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, NodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, NodeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn read_u64(&mut self) -> Result<u64, NodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Errors that can occur while decoding a page record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The record ended early.
    Truncated { needed: usize, available: usize },
    /// Unknown page type byte.
    InvalidPageType(u8),
    /// Key count does not match record or child count.
    Misaligned { keys: usize, entries: usize },
    /// The declared record length does not fit the page.
    LengthExceedsPage { offset: Offset, len: u64, budget: u64 },
    /// An index node is too large for an index page.
    IndexPageOverflow { offset: Offset, len: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "record truncated: need {needed} bytes, have {available}")
            }
            Self::InvalidPageType(value) => write!(f, "invalid page type: {value}"),
            Self::Misaligned { keys, entries } => {
                write!(f, "node has {keys} keys but {entries} entries")
            }
            Self::LengthExceedsPage {
                offset,
                len,
                budget,
            } => write!(
                f,
                "page at {offset} declares {len} bytes, more than its {budget} byte budget"
            ),
            Self::IndexPageOverflow { offset, len } => {
                write!(f, "index node at {offset} needs {len} bytes, more than one index page")
            }
        }
    }
}

impl std::error::Error for NodeError {}
