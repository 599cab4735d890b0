//! Chunk tickets
//!
//! A ticket keeps a chunk loaded. Forced tickets are persistent: they
//! describe chunks the restored data may no longer have, so they are
//! dropped when a restore begins. Player and spawn tickets are
//! re-issued by the host and survive.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::partition::ChunkPos;
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TicketKind {
    Player,
    Forced,
    Spawn,
}

impl TicketKind {
    pub fn is_persistent(&self) -> bool {
        matches!(self, TicketKind::Forced)
    }
}

pub struct TicketManager {
    world: String,
    tickets: Mutex<BTreeMap<ChunkPos, Vec<TicketKind>>>,
}

impl TicketManager {
    pub fn new(world: impl Into<String>) -> Self {
        Self {
            world: world.into(),
            tickets: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ChunkPos, Vec<TicketKind>>> {
        self.tickets.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add(&self, pos: ChunkPos, kind: TicketKind) {
        self.lock().entry(pos).or_default().push(kind);
    }

    /// Removes one ticket of `kind`; returns false if there was none.
    pub fn remove(&self, pos: ChunkPos, kind: TicketKind) -> bool {
        let mut tickets = self.lock();
        let Some(kinds) = tickets.get_mut(&pos) else {
            return false;
        };
        let Some(idx) = kinds.iter().position(|k| *k == kind) else {
            return false;
        };
        kinds.remove(idx);
        if kinds.is_empty() {
            tickets.remove(&pos);
        }
        true
    }

    pub fn tickets_at(&self, pos: ChunkPos) -> Vec<TicketKind> {
        self.lock().get(&pos).cloned().unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn drop_persistent(&self) -> usize {
        let mut tickets = self.lock();
        let before: usize = tickets.values().map(Vec::len).sum();
        tickets.retain(|_, kinds| {
            kinds.retain(|k| !k.is_persistent());
            !kinds.is_empty()
        });
        before - tickets.values().map(Vec::len).sum::<usize>()
    }
}

impl Restorable for TicketManager {
    fn kind(&self) -> ComponentKind {
        ComponentKind::TicketManager
    }

    fn label(&self) -> String {
        format!("tickets:{}", self.world)
    }

    fn pre_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.drop_persistent();
        Ok(())
    }

    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_add_remove() {
        let tickets = TicketManager::new("overworld");
        let pos = ChunkPos::new(1, 2);
        tickets.add(pos, TicketKind::Player);
        tickets.add(pos, TicketKind::Player);
        assert_eq!(tickets.count(), 2);
        assert!(tickets.remove(pos, TicketKind::Player));
        assert!(!tickets.remove(pos, TicketKind::Forced));
        assert_eq!(tickets.tickets_at(pos), vec![TicketKind::Player]);
    }

    #[test]
    fn test_restore_drops_forced_tickets_only() {
        let tickets = TicketManager::new("overworld");
        tickets.add(ChunkPos::new(0, 0), TicketKind::Forced);
        tickets.add(ChunkPos::new(0, 0), TicketKind::Spawn);
        tickets.add(ChunkPos::new(5, 5), TicketKind::Forced);

        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        tickets.pre_restore(&ctx).unwrap();
        tickets.post_restore(&ctx).unwrap();

        assert_eq!(tickets.count(), 1);
        assert_eq!(tickets.tickets_at(ChunkPos::new(0, 0)), vec![TicketKind::Spawn]);
        assert!(tickets.tickets_at(ChunkPos::new(5, 5)).is_empty());
    }
}
