//! Live restore
//!
//! Restoring replaces region files under a running server. Every
//! component between the live world and disk implements `Restorable`;
//! the coordinator walks that tree:
//!
//! 1. Quiesce: `pre_restore` parent-first. Workers stop admitting I/O and
//!    drain their queues; storage closes its file handles.
//! 2. Swap: replacement region files are staged from the content store
//!    and renamed over the live ones.
//! 3. Resume: `post_restore` children first, so storage reopens before
//!    its worker admits writes. Caches are dropped, derived state is
//!    rebuilt from the restored files.
//!
//! A failure during quiesce or staging aborts with live data untouched.
//! A failure once a live file was replaced leaves the coordinator
//! `Inconsistent` and reports `RV_RESTORE_PARTIALLY_APPLIED`.

mod component;
mod context;
mod coordinator;
mod errors;
pub mod swap;

pub use component::{ComponentKind, Restorable};
pub use context::{RestoreContext, RestorePhase};
pub use coordinator::{RestoreCoordinator, RestoreReport};
pub use errors::{RestoreError, RestoreErrorCode, RestoreResult, Severity};
pub use swap::SwapReport;
