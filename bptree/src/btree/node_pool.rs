//! Pool of reusable in-memory nodes.
//!
//! Every page touch checks a node out of the pool and hands it back when the
//! operation is done with it. Decoding into a recycled node reuses its key,
//! record and child vectors instead of allocating fresh ones.
//!
//! # Design
//!
//! - Nodes are leased as `PooledNode` guards and returned on `Drop`, so a
//!   lease is released on every exit path, including `?` early returns
//! - The pool grows on demand and never runs dry; at most `capacity` idle
//!   nodes are retained
//! - Thread-safe: uses a Mutex for the idle list, so one pool can be shared
//!   by several trees
//!
//! # Invariants
//!
//! - `outstanding()` equals the number of live `PooledNode` guards
//! - Every node handed out is in its fresh (reset) state

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::btree::node::Node;

/// Default number of idle nodes retained by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// A pool of reusable nodes.
#[derive(Debug)]
pub struct NodePool {
    /// Idle nodes ready for checkout.
    idle: Mutex<Vec<Box<Node>>>,
    /// Maximum number of idle nodes kept.
    capacity: usize,
    /// Nodes currently checked out.
    outstanding: AtomicUsize,
}

impl NodePool {
    /// Create an empty pool retaining at most `capacity` idle nodes.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Check out a fresh node.
    ///
    /// # Post-conditions
    /// - The node is in its default state
    /// - `outstanding()` increased by 1
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn checkout(self: &Arc<Self>) -> PooledNode {
        let node = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        PooledNode {
            node: Some(node),
            pool: Arc::clone(self),
        }
    }

    /// Reset `node` and keep it for reuse if the pool has room.
    fn give_back(&self, mut node: Box<Node>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        node.reset();

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(node);
        }
    }

    /// Number of nodes currently checked out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of idle nodes ready for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Maximum number of idle nodes retained.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A node leased from a `NodePool`; returned to the pool when dropped.
#[derive(Debug)]
pub struct PooledNode {
    /// Always `Some` until `Drop`.
    node: Option<Box<Node>>,
    pool: Arc<NodePool>,
}

impl Deref for PooledNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        // `node` is only taken in `drop`.
        self.node.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledNode {
    fn deref_mut(&mut self) -> &mut Node {
        self.node.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledNode {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.pool.give_back(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::INVALID_OFFSET;

    #[test]
    fn test_checkout_and_return() {
        let pool = NodePool::new(4);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 0);

        {
            let _a = pool.checkout();
            let _b = pool.checkout();
            assert_eq!(pool.outstanding(), 2);
        }

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_returned_node_is_reset() {
        let pool = NodePool::new(1);
        {
            let mut node = pool.checkout();
            node.active = true;
            node.self_offset = 8192;
            node.keys.extend([1, 2, 3]);
            node.records.push(b"x".to_vec());
        }

        let node = pool.checkout();
        assert_eq!(*node, Node::default());
        assert_eq!(node.self_offset, INVALID_OFFSET);
        // The recycled vectors keep their capacity.
        assert!(node.keys.capacity() >= 3);
    }

    #[test]
    fn test_idle_list_is_capped() {
        let pool = NodePool::new(2);
        {
            let _nodes: Vec<PooledNode> = (0..5).map(|_| pool.checkout()).collect();
            assert_eq!(pool.outstanding(), 5);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_returned_on_early_exit() {
        fn fails(pool: &Arc<NodePool>) -> Result<(), &'static str> {
            let _node = pool.checkout();
            Err("early exit")
        }

        let pool = NodePool::new(4);
        assert!(fails(&pool).is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_shared_across_threads() {
        let pool = NodePool::new(8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut node = pool.checkout();
                        node.keys.push(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.idle() <= 8);
    }
}
