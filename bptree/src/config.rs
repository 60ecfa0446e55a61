//! Tree configuration module.
//!
//! This module provides configuration loading for a tree from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `BPTREE_ORDER`: Maximum keys per node (default: `4`)
//! - `BPTREE_INDEX_PAGE_SIZE`: Index page size in bytes (default: `4096`)
//! - `BPTREE_DATA_PAGE_SIZE`: Data page size in bytes (default: `8192`)
//! - `BPTREE_MAX_FREE_BLOCKS`: Slots added per free-list padding step (default: `100`)
//! - `BPTREE_POOL_CAPACITY`: Idle nodes kept by the node pool (default: `64`)
//!
//! # Invariants
//!
//! A validated config always has:
//! - `3 <= order <= 254`, and a full index node fits in one index page
//! - power-of-two page sizes with `data_page_size >= index_page_size`

use crate::btree::node::{FIXED_BODY_SIZE, LEN_PREFIX_SIZE, MAX_ENTRIES};
use crate::btree::node_pool::DEFAULT_POOL_CAPACITY;
use crate::storage::allocator::DEFAULT_MAX_FREE_BLOCKS;
use crate::storage::page::{DEFAULT_DATA_PAGE_SIZE, DEFAULT_INDEX_PAGE_SIZE};

/// Tree configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Maximum number of keys per node.
    pub order: usize,
    /// Requested index page size; raised to the filesystem block size on open.
    pub index_page_size: u64,
    /// Requested data page size; raised to the filesystem block size on open.
    pub data_page_size: u64,
    /// Number of slots added to the free lists per padding step.
    pub max_free_blocks: usize,
    /// Number of idle nodes the node pool retains.
    pub pool_capacity: usize,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            order: Self::DEFAULT_ORDER,
            index_page_size: DEFAULT_INDEX_PAGE_SIZE,
            data_page_size: DEFAULT_DATA_PAGE_SIZE,
            max_free_blocks: DEFAULT_MAX_FREE_BLOCKS,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl TreeConfig {
    /// Default order.
    pub const DEFAULT_ORDER: usize = 4;
    /// Smallest order that still splits into two non-empty halves.
    pub const MIN_ORDER: usize = 3;
    /// Largest order whose transient `order + 1` entries fit the `u8` counts.
    pub const MAX_ORDER: usize = MAX_ENTRIES - 1;

    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            order: parse_var(&lookup, "BPTREE_ORDER", defaults.order)?,
            index_page_size: parse_var(&lookup, "BPTREE_INDEX_PAGE_SIZE", defaults.index_page_size)?,
            data_page_size: parse_var(&lookup, "BPTREE_DATA_PAGE_SIZE", defaults.data_page_size)?,
            max_free_blocks: parse_var(&lookup, "BPTREE_MAX_FREE_BLOCKS", defaults.max_free_blocks)?,
            pool_capacity: parse_var(&lookup, "BPTREE_POOL_CAPACITY", defaults.pool_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a usable tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, size) in [
            ("index_page_size", self.index_page_size),
            ("data_page_size", self.data_page_size),
        ] {
            if !size.is_power_of_two() {
                return Err(invalid(name, format!("{size} is not a power of two")));
            }
        }
        if self.data_page_size < self.index_page_size {
            return Err(invalid(
                "data_page_size",
                format!(
                    "{} is smaller than the index page size {}",
                    self.data_page_size, self.index_page_size
                ),
            ));
        }

        if !(Self::MIN_ORDER..=Self::MAX_ORDER).contains(&self.order) {
            return Err(invalid(
                "order",
                format!(
                    "{} is outside {}..={}",
                    self.order,
                    Self::MIN_ORDER,
                    Self::MAX_ORDER
                ),
            ));
        }
        let full_index_node = Self::index_node_len(self.order + 1);
        if full_index_node > self.index_page_size {
            return Err(invalid(
                "order",
                format!(
                    "an overfull index node needs {full_index_node} bytes but index pages hold {}",
                    self.index_page_size
                ),
            ));
        }

        if self.max_free_blocks < 2 {
            return Err(invalid(
                "max_free_blocks",
                format!("{} is less than 2", self.max_free_blocks),
            ));
        }
        Ok(())
    }

    /// Encoded size of an index node with `entries` children.
    const fn index_node_len(entries: usize) -> u64 {
        (LEN_PREFIX_SIZE + FIXED_BODY_SIZE + entries * 16) as u64
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| invalid(name, format!("'{value}' is not a valid number"))),
        None => Ok(default),
    }
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}
