//! regionvault - live backup and restore for a region-partitioned dataset
//!
//! Backups are deduplicated into a content-addressed blob store and
//! recorded in a catalog. Restores quiesce every stateful component of
//! the running host, swap region files, then resume.

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod content_store;
pub mod durability;
pub mod host;
pub mod observability;
pub mod partition;
pub mod region;
pub mod restore;
pub mod retry;
pub mod worker;
