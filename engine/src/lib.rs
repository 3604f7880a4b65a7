//! Orchestration engine: scheduler, context loader, theme/flow index,
//! branch manager, git bridge and session boot, all wired together by an
//! explicit [`server::Server`] handle.
//!
//! Everything here reads through the store's query surface and mutates
//! exclusively through store change sets; the only other side effects are
//! Git operations, serialized behind the server's process-wide Git mutex.

pub mod branch;
pub mod context;
pub mod events;
pub mod fsutil;
pub mod git_bridge;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod theme_flow;

pub use branch::{BranchManager, BranchStatusReport, MergeReport, OrgMainOutcome};
pub use context::{ContextLoader, ContextPlan, Escalation};
pub use events::{EventMaintenance, PlaceholderFinding};
pub use git_bridge::{ChangeKind, GitBridge, ReconciliationPlan, Strategy, ThemeProposal};
pub use scheduler::{
    CompletionPathDoc, Scheduler, SidequestCompletion, SidequestSpec, SubtaskSpec, TaskSpec,
    WorkItemRef,
};
pub use server::Server;
pub use session::{BootOptions, BootPath, BootReport, SessionBoot};
pub use theme_flow::ThemeFlowIndex;
