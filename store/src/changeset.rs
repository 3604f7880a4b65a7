//! Change sets: the unit of atomic paired mutation.
//!
//! A change set describes SQL statements and file operations that must land
//! together. Components build change sets declaratively; only the store
//! executes them. Ordinal-bearing ids (sidequest ordinals, branch numbers)
//! are left as `{{ordinal}}` / `{{ordinal3}}` tokens and resolved by the
//! store inside the same transaction that inserts the row, which is what
//! makes the numbers strictly monotonic under concurrent tool calls.

use chrono::{DateTime, Utc};
use pm_core::models::EntityKind;
use serde_json::Value;
use std::path::PathBuf;

/// Token replaced with the allocated ordinal, unpadded.
pub const ORDINAL_TOKEN: &str = "{{ordinal}}";
/// Token replaced with the allocated ordinal, zero-padded to three digits.
pub const ORDINAL3_TOKEN: &str = "{{ordinal3}}";

/// A typed SQL parameter. The store binds these positionally.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// One SQL statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// How a staged JSON document is rendered.
///
/// `UserEdited` files are always written indented with stable key order so
/// hand edits survive round trips; `Machine` files follow the project's
/// `minifyJson` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStyle {
    UserEdited,
    Machine,
}

/// Contents staged for a file write.
#[derive(Debug, Clone, PartialEq)]
pub enum FileContents {
    Json { value: Value, style: JsonStyle },
    Text(String),
}

/// One file operation within the change set. Paths are absolute.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOp {
    Write { path: PathBuf, contents: FileContents },
    Rename { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
}

impl FileOp {
    /// Paths whose pre-images must be preserved before the op runs.
    pub fn touched_paths(&self) -> Vec<&PathBuf> {
        match self {
            FileOp::Write { path, .. } => vec![path],
            FileOp::Rename { from, to } => vec![from, to],
            FileOp::Delete { path } => vec![path],
        }
    }
}

/// Scope for ordinal allocation inside the applying transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrdinalScope {
    /// `MAX(ordinal)+1` over the parent task's sidequests
    Sidequest { parent_task_id: String },
    /// `MAX(branch_number)+1` over all registered branches
    Branch,
}

/// What changed, for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Archived,
    Deleted,
}

/// A post-commit notification published to `subscribe(kind)` listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub kind: EntityKind,
    pub id: String,
    pub change: ChangeType,
}

/// A complete atomic unit: SQL + files + notifications.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Human-readable description, logged and recorded in
    /// `file_modifications`
    pub description: String,
    pub statements: Vec<SqlStatement>,
    pub file_ops: Vec<FileOp>,
    pub allocator: Option<OrdinalScope>,
    pub notices: Vec<ChangeNotice>,
}

impl ChangeSet {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn statement(mut self, sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        self.statements.push(SqlStatement {
            sql: sql.into(),
            params,
        });
        self
    }

    pub fn write_json(mut self, path: impl Into<PathBuf>, value: Value, style: JsonStyle) -> Self {
        self.file_ops.push(FileOp::Write {
            path: path.into(),
            contents: FileContents::Json { value, style },
        });
        self
    }

    pub fn write_text(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.file_ops.push(FileOp::Write {
            path: path.into(),
            contents: FileContents::Text(text.into()),
        });
        self
    }

    pub fn rename(mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        self.file_ops.push(FileOp::Rename {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn delete(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_ops.push(FileOp::Delete { path: path.into() });
        self
    }

    pub fn with_ordinal(mut self, scope: OrdinalScope) -> Self {
        self.allocator = Some(scope);
        self
    }

    pub fn notify(mut self, kind: EntityKind, id: impl Into<String>, change: ChangeType) -> Self {
        self.notices.push(ChangeNotice {
            kind,
            id: id.into(),
            change,
        });
        self
    }

    /// Whether any part of the change set still carries an ordinal token.
    pub fn needs_ordinal(&self) -> bool {
        let in_str = |s: &str| s.contains(ORDINAL_TOKEN) || s.contains(ORDINAL3_TOKEN);
        self.statements
            .iter()
            .any(|s| s.params.iter().any(|p| matches!(p, SqlValue::Text(t) if in_str(t))))
            || self.file_ops.iter().any(|op| match op {
                FileOp::Write { path, contents } => {
                    in_str(&path.to_string_lossy())
                        || match contents {
                            FileContents::Text(t) => in_str(t),
                            FileContents::Json { value, .. } => json_contains_token(value),
                        }
                }
                FileOp::Rename { from, to } => {
                    in_str(&from.to_string_lossy()) || in_str(&to.to_string_lossy())
                }
                FileOp::Delete { path } => in_str(&path.to_string_lossy()),
            })
            || self.notices.iter().any(|n| in_str(&n.id))
    }

    /// Replace ordinal tokens everywhere with the allocated value.
    pub fn resolve_ordinal(&mut self, ordinal: u32) {
        let plain = ordinal.to_string();
        let padded = format!("{ordinal:03}");
        let fix = |s: &str| s.replace(ORDINAL3_TOKEN, &padded).replace(ORDINAL_TOKEN, &plain);

        for statement in &mut self.statements {
            for param in &mut statement.params {
                if let SqlValue::Text(text) = param {
                    *param = SqlValue::Text(fix(text));
                }
            }
        }
        for op in &mut self.file_ops {
            match op {
                FileOp::Write { path, contents } => {
                    *path = PathBuf::from(fix(&path.to_string_lossy()));
                    match contents {
                        FileContents::Text(text) => *text = fix(text),
                        FileContents::Json { value, .. } => json_substitute(value, &fix),
                    }
                }
                FileOp::Rename { from, to } => {
                    *from = PathBuf::from(fix(&from.to_string_lossy()));
                    *to = PathBuf::from(fix(&to.to_string_lossy()));
                }
                FileOp::Delete { path } => {
                    *path = PathBuf::from(fix(&path.to_string_lossy()));
                }
            }
        }
        for notice in &mut self.notices {
            notice.id = fix(&notice.id);
        }
    }
}

fn json_contains_token(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(ORDINAL_TOKEN) || s.contains(ORDINAL3_TOKEN),
        Value::Array(items) => items.iter().any(json_contains_token),
        Value::Object(map) => map.values().any(json_contains_token),
        _ => false,
    }
}

fn json_substitute(value: &mut Value, fix: &impl Fn(&str) -> String) {
    match value {
        Value::String(s) => *s = fix(s),
        Value::Array(items) => items.iter_mut().for_each(|v| json_substitute(v, fix)),
        Value::Object(map) => map.values_mut().for_each(|v| json_substitute(v, fix)),
        _ => {}
    }
}
