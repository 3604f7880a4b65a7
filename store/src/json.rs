//! JSON rendering policy for paired file writes.
//!
//! Two classes of artifact exist on disk: user-edited documents (themes,
//! flow files, config) and machine-owned documents (task state, snapshots,
//! queue entries). User-edited documents are always written indented with
//! key order preserved so hand edits survive a round trip; machine-owned
//! documents follow the project's `minifyJson` setting.

use serde_json::Value;

use crate::changeset::JsonStyle;

/// Render a JSON document according to its style and the project's
/// minification setting. Output always ends with a newline so files diff
/// cleanly.
pub fn render(value: &Value, style: JsonStyle, minify_machine_json: bool) -> String {
    let body = match style {
        JsonStyle::UserEdited => pretty(value),
        JsonStyle::Machine => {
            if minify_machine_json {
                value.to_string()
            } else {
                pretty(value)
            }
        }
    };
    format!("{body}\n")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
