//! Identifier generation and format validation.
//!
//! Id shapes are part of the on-disk contract: task and sidequest files are
//! named after their ids, and branch names must sort in allocation order.
//! Ordinal-bearing ids (`SQ-...-NNN`, `ai-pm-org-branch-NNN`) are only
//! completed inside the store transaction that allocates the ordinal.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{PmError, Result};

/// The canonical organizational branch name.
pub const ORG_MAIN_BRANCH: &str = "ai-pm-org-main";

/// Prefix shared by all work branches.
pub const WORK_BRANCH_PREFIX: &str = "ai-pm-org-branch-";

fn task_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^TASK-\d{14}$").unwrap())
}

fn sidequest_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^SQ-\d{14}-\d{3,}$").unwrap())
}

fn subtask_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ST-\d+$").unwrap())
}

fn milestone_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^M-\d+$").unwrap())
}

fn plan_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^M\d+-v\d+-[a-z0-9][a-z0-9-]*$").unwrap())
}

fn work_branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ai-pm-org-branch-(\d{3,})$").unwrap())
}

fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// `TASK-<yyyymmddHHMMSS>` from the creation instant.
pub fn task_id(at: DateTime<Utc>) -> String {
    format!("TASK-{}", compact_timestamp(at))
}

/// `SQ-<yyyymmddHHMMSS>-<NNN>`; the ordinal comes from the allocating
/// transaction.
pub fn sidequest_id(at: DateTime<Utc>, ordinal: u32) -> String {
    format!("SQ-{}-{ordinal:03}", compact_timestamp(at))
}

/// `ST-<n>` within the parent.
pub fn subtask_id(ordinal: u32) -> String {
    format!("ST-{ordinal:02}")
}

/// `event-<epoch-ms>` for noteworthy events.
pub fn event_id(at: DateTime<Utc>) -> String {
    format!("event-{}", at.timestamp_millis())
}

/// `M<n>-v<k>-<slug>` implementation-plan id.
pub fn plan_id(milestone_number: u32, version: u32, slug: &str) -> String {
    format!("M{milestone_number:02}-v{version}-{slug}")
}

/// `ai-pm-org-branch-<NNN>`, zero-padded to at least three digits.
pub fn work_branch_name(number: u32) -> String {
    format!("{WORK_BRANCH_PREFIX}{number:03}")
}

/// Extract the number from a work branch name, if it is one.
pub fn parse_work_branch(name: &str) -> Option<u32> {
    work_branch_re()
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Reduce a free-form title to a plan-id slug.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Validate a task id (`TASK-<timestamp>`).
pub fn validate_task_id(id: &str) -> Result<()> {
    if task_id_re().is_match(id) {
        Ok(())
    } else {
        Err(PmError::Validation(format!("Invalid task id: '{id}'")))
    }
}

/// Validate a sidequest id (`SQ-<timestamp>-<NNN>`).
pub fn validate_sidequest_id(id: &str) -> Result<()> {
    if sidequest_id_re().is_match(id) {
        Ok(())
    } else {
        Err(PmError::Validation(format!("Invalid sidequest id: '{id}'")))
    }
}

/// Validate a subtask id (`ST-<n>`).
pub fn validate_subtask_id(id: &str) -> Result<()> {
    if subtask_id_re().is_match(id) {
        Ok(())
    } else {
        Err(PmError::Validation(format!("Invalid subtask id: '{id}'")))
    }
}

/// Validate a milestone id (`M-<n>`).
pub fn validate_milestone_id(id: &str) -> Result<()> {
    if milestone_id_re().is_match(id) {
        Ok(())
    } else {
        Err(PmError::Validation(format!("Invalid milestone id: '{id}'")))
    }
}

/// Validate an implementation plan id (`M<n>-v<k>-<slug>`).
pub fn validate_plan_id(id: &str) -> Result<()> {
    if plan_id_re().is_match(id) {
        Ok(())
    } else {
        Err(PmError::Validation(format!("Invalid plan id: '{id}'")))
    }
}

/// Validate a theme name: lowercase kebab-case, as used for file names.
pub fn validate_theme_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PmError::empty_field("theme name"));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(PmError::Validation(format!(
            "Theme name must be kebab-case: '{name}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 12, 9, 30, 15).unwrap()
    }

    #[test]
    fn test_task_id_shape() {
        let id = task_id(fixed_now());
        assert_eq!(id, "TASK-20250712093015");
        assert!(validate_task_id(&id).is_ok());
        assert!(validate_task_id("TASK-123").is_err());
        assert!(validate_task_id("T-20250712093015").is_err());
    }

    #[test]
    fn test_sidequest_id_shape() {
        let id = sidequest_id(fixed_now(), 1);
        assert_eq!(id, "SQ-20250712093015-001");
        assert!(validate_sidequest_id(&id).is_ok());
        // Ordinals past 999 widen without breaking validation
        assert!(validate_sidequest_id(&sidequest_id(fixed_now(), 1234)).is_ok());
        assert!(validate_sidequest_id("SQ-20250712093015-1").is_err());
    }

    #[test]
    fn test_subtask_and_milestone_ids() {
        assert_eq!(subtask_id(2), "ST-02");
        assert!(validate_subtask_id("ST-02").is_ok());
        assert!(validate_subtask_id("ST-").is_err());

        assert!(validate_milestone_id("M-02").is_ok());
        assert!(validate_milestone_id("M02").is_err());
    }

    #[test]
    fn test_branch_names() {
        assert_eq!(work_branch_name(1), "ai-pm-org-branch-001");
        assert_eq!(work_branch_name(42), "ai-pm-org-branch-042");
        assert_eq!(work_branch_name(1234), "ai-pm-org-branch-1234");

        assert_eq!(parse_work_branch("ai-pm-org-branch-007"), Some(7));
        assert_eq!(parse_work_branch("ai-pm-org-branch-1234"), Some(1234));
        assert_eq!(parse_work_branch(ORG_MAIN_BRANCH), None);
        assert_eq!(parse_work_branch("ai-pm-org-branch-7"), None);
    }

    #[test]
    fn test_plan_id_and_slug() {
        assert_eq!(slugify("Payment Processing (v2)"), "payment-processing-v2");
        assert_eq!(slugify("  --weird--  input  "), "weird-input");

        let id = plan_id(2, 3, "payment-processing");
        assert_eq!(id, "M02-v3-payment-processing");
        assert!(validate_plan_id(&id).is_ok());
        assert!(validate_plan_id("M02-payment").is_err());
    }

    #[test]
    fn test_theme_name_validation() {
        assert!(validate_theme_name("authentication").is_ok());
        assert!(validate_theme_name("user-profile2").is_ok());
        assert!(validate_theme_name("Auth").is_err());
        assert!(validate_theme_name("-auth").is_err());
        assert!(validate_theme_name("").is_err());
    }

    #[test]
    fn test_event_id_uses_millis() {
        let at = Utc.timestamp_millis_opt(1_752_312_615_123).unwrap();
        assert_eq!(event_id(at), "event-1752312615123");
    }
}
