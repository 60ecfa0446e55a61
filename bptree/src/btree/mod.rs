//! Disk-resident B+Tree over `u64` keys.
//!
//! # Structure
//!
//! - Index nodes: one key per child, holding the largest key under that child
//! - Leaf nodes: key/value records, doubly linked for in-order scans
//! - Extend pages: the tail of a leaf whose records outgrow its data page
//!
//! Nodes refer to each other by file offset; the file itself is the arena.
//!
//! # Usage
//!
//! ```no_run
//! use bptree::btree::BPlusTree;
//!
//! let mut tree = BPlusTree::open(std::path::Path::new("index.bpt"))?;
//! tree.insert(42, b"answer")?;
//! assert_eq!(tree.find(42)?, b"answer");
//! tree.close()?;
//! # Ok::<(), bptree::btree::TreeError>(())
//! ```

pub mod node;
pub mod node_pool;
pub mod overflow;
pub mod recovery;
pub mod store;
pub mod tree;

pub use node::{Node, NodeError, PageOverflow};
pub use node_pool::{DEFAULT_POOL_CAPACITY, NodePool, PooledNode};
pub use tree::{BPlusTree, TreeCursor, TreeError, TreeStats};
