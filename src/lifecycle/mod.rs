//! Lifecycle Coordinator
//!
//! Ties cached entries to what a user is doing: navigation events move
//! entries through the lifecycle state machine, and a periodic sweep releases
//! whatever is no longer needed.

pub mod coordinator;
pub mod entry;
pub mod session;

pub use coordinator::{
    CleanupSummary, LifecycleConfig, LifecycleCoordinator, LifecycleStatus, NavigationOutcome, SweepReport,
};
pub use entry::{LifecycleEntry, LifecycleState};
pub use session::{contexts_overlap, HubMatcher, NavigationEvent, NavigationEventType, NavigationSession};
