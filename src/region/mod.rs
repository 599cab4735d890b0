//! Region storage: the on-disk side of a shard
//!
//! A shard's partitions live in one append-only region file. The
//! persistence worker talks to it only through `ShardStorage`, so tests
//! can put a fault-injecting implementation behind a real worker.

mod errors;
mod file;
mod storage;

pub use errors::{RegionError, RegionResult};
pub use file::RegionFile;
pub use storage::RegionStorage;

use crate::partition::{ChunkPos, ShardKey};
use crate::restore::Restorable;

/// Storage handle behind one persistence worker.
///
/// Its `Restorable` hooks run after the worker's own: `pre_restore`
/// closes open handles, `post_restore` allows them to reopen.
pub trait ShardStorage: Restorable + 'static {
    fn shard(&self) -> &ShardKey;

    fn read(&self, pos: ChunkPos) -> RegionResult<Option<Vec<u8>>>;

    fn write(&self, pos: ChunkPos, data: &[u8]) -> RegionResult<()>;

    /// Every stored partition of the shard.
    fn entries(&self) -> RegionResult<Vec<(ChunkPos, Vec<u8>)>>;

    fn sync(&self) -> RegionResult<()>;

    /// False when no file handle has been opened yet (or it was closed).
    fn is_open(&self) -> bool;
}
