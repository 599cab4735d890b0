//! The restorable component capability
//!
//! Every stateful subsystem between the live world and disk implements
//! `Restorable`. Parents hand out their children through `children()`;
//! edges point from owner to owned only, so the graph the coordinator
//! walks is acyclic by construction. Upward references (a chunk manager
//! naming its world) are plain identifiers and never appear here.

use std::fmt;
use std::sync::Arc;

use super::context::RestoreContext;
use super::errors::RestoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Server,
    World,
    TicketManager,
    EntityIndex,
    ChunkManager,
    PersistenceWorker,
    Storage,
    /// Anything outside the built-in host model
    Custom,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Server => "server",
            ComponentKind::World => "world",
            ComponentKind::TicketManager => "ticket_manager",
            ComponentKind::EntityIndex => "entity_index",
            ComponentKind::ChunkManager => "chunk_manager",
            ComponentKind::PersistenceWorker => "persistence_worker",
            ComponentKind::Storage => "storage",
            ComponentKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quiesce/resume hooks.
///
/// `pre_restore` is called parent-first; by the time it returns the
/// component holds no pending asynchronous work against storage and
/// rejects new work. `children()` is asked *after* the parent's
/// `pre_restore`, so a parent that stops creating children when it
/// quiesces hands out a complete list. `post_restore` runs children
/// first once the swap is done, so nothing a parent lets through on
/// resume reaches a child that is still quiesced.
///
/// Components without persistent state implement both hooks as a clear
/// or a no-op.
pub trait Restorable: Send + Sync {
    fn kind(&self) -> ComponentKind;

    /// Human-readable identity used in logs and error context.
    fn label(&self) -> String;

    fn pre_restore(&self, ctx: &RestoreContext) -> RestoreResult<()>;

    fn post_restore(&self, ctx: &RestoreContext) -> RestoreResult<()>;

    fn children(&self) -> Vec<Arc<dyn Restorable>> {
        Vec::new()
    }
}

/// Pointer identity of a component, used to visit shared nodes once.
pub(crate) fn component_id(component: &Arc<dyn Restorable>) -> usize {
    Arc::as_ptr(component) as *const () as usize
}
