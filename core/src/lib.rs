//! Orchestrator Core Library
//!
//! This crate provides the foundational domain models, error kinds, and
//! pure business rules for the work and context orchestrator. All other
//! crates depend on the types defined here.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`models`] - Core domain entities (Task, Sidequest, Theme, Flow, ...)
//! - [`error`] - Error kinds and result handling
//! - [`ids`] - Identifier generation and format validation
//! - [`config`] - Per-project configuration (`UserSettings/config.json`)
//! - [`layout`] - The fixed `projectManagement/` path map
//! - [`validation`] - Flow-reference integrity checks
//!
//! # Example
//!
//! ```rust
//! use pm_core::models::WorkStatus;
//!
//! // A blocked task may resume or be cancelled, nothing else
//! assert!(WorkStatus::Blocked.can_transition_to(WorkStatus::InProgress));
//! assert!(!WorkStatus::Blocked.can_transition_to(WorkStatus::Completed));
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod layout;
pub mod models;
pub mod validation;

// Re-export commonly used types at the crate root for convenience
pub use config::{ProjectConfig, ValidationLevel};
pub use error::{PmError, Result, LIMIT_RESOLUTIONS};
pub use layout::ProjectLayout;
pub use models::{
    Branch, BranchAuthor, BranchMeta, BranchStatus, ContextMode, ContextSnapshot, EntityKind,
    Flow, FlowReference, FlowState, FlowStep, GitProjectState, ImpactLevel, ImplementationPlan,
    Milestone, MilestoneStatus, NoteworthyEvent, ParentKind, PlanStatus, Priority,
    ReconciliationStatus, Session, SessionStatus, Severity, Sidequest, Subtask, Task, Theme,
    WorkStatus,
};
pub use validation::{FlowCatalog, FlowRefValidator, ValidationFinding};

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
