//! Minimal host model
//!
//! Just enough of a running server to exercise the restore protocol:
//! worlds with a dirty chunk cache, lazily spawned per-region workers,
//! persistent tickets and an identity-keyed entity index.

mod chunk;
mod chunk_manager;
mod entities;
mod errors;
mod server;
mod tickets;
mod world;

pub use chunk::ChunkData;
pub use chunk_manager::{ChunkManager, RegionWorker};
pub use entities::EntityIndex;
pub use errors::{HostError, HostResult};
pub use server::{Server, ServerRoot};
pub use tickets::{TicketKind, TicketManager};
pub use world::{SaveOutcome, World};
