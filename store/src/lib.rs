//! Hybrid file+database store for the work and context orchestrator.
//!
//! Definitions live in JSON/markdown files under `projectManagement/`;
//! operational state lives in SQLite. Every mutation is a paired write:
//! the SQL statements and file operations of a [`ChangeSet`] commit as one
//! serializable unit, or not at all. Recovery after an unclean shutdown is
//! a replay of the journal sidecars left in the database directory.
//!
//! # Example
//!
//! ```rust,no_run
//! use pm_core::layout::ProjectLayout;
//! use store::{ChangeSet, Store, StoreOptions};
//!
//! # async fn example() -> pm_core::error::Result<()> {
//! let layout = ProjectLayout::new("/path/to/project");
//! let store = Store::open(layout, StoreOptions::default()).await?;
//!
//! let change = ChangeSet::new("touch preference").statement(
//!     "INSERT INTO user_preferences (key, value, updated_at) VALUES (?, ?, ?)",
//!     vec!["greeting".into(), "hello".into(), chrono::Utc::now().into()],
//! );
//! store.apply(change).await?;
//! # Ok(())
//! # }
//! ```

pub mod changeset;
pub mod common;
pub mod json;
pub mod paired;
pub mod sqlite;
pub mod views;

pub use changeset::{
    ChangeNotice, ChangeSet, ChangeType, FileContents, FileOp, JsonStyle, OrdinalScope,
    SqlStatement, SqlValue,
};
pub use sqlite::{Applied, RecoveryReport, Store, StoreOptions};
pub use views::{
    ActiveSidequestRow, EventImpactRow, FlowThemeSummaryRow, SessionContextRow,
    SidequestLimitRow, SubtaskSidequestRow, ThemeEventActivityRow, ThemeFlowSummaryRow,
};
