// Layers, bottom up:
// 1. storage: page geometry, positional file I/O, free-space allocation
// 2. btree: node codec, node pool, node store, tree engine, recovery
//
// Life of a write:
// 1. Descend from the root to the leaf, reading nodes into pooled buffers
// 2. Insert or update the record in memory
// 3. Split or rebalance up the parent chain
// 4. Flush every touched node back to its page

pub mod btree;
pub mod config;
pub mod storage;

pub use btree::{BPlusTree, TreeError};
pub use config::{ConfigError, TreeConfig};
