//! Name validation for tables and iterator stages
//!
//! Table names are `[namespace.]table` where both parts use `[A-Za-z0-9_]`.
//! A name without a namespace lives in the default namespace.

use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AdminError, Result};

/// Internal table identity. Stable across rename; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Maximum table name length, namespace included.
pub const MAX_TABLE_NAME_LEN: usize = 128;

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9_]+\.)?[A-Za-z0-9_]+$").expect("static table name pattern")
    })
}

fn stage_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static stage name pattern"))
}

/// Validate a table name
///
/// Allowed: `[A-Za-z0-9_]+` optionally prefixed by `namespace.`
/// Length: 1-128 characters
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
        return Err(AdminError::invalid(format!(
            "Table name must be 1-{} characters",
            MAX_TABLE_NAME_LEN
        )));
    }

    if !table_name_pattern().is_match(name) {
        return Err(AdminError::invalid(format!(
            "Table name '{}' may only contain a-z, A-Z, 0-9, _ and one namespace separator",
            name
        )));
    }

    Ok(())
}

/// Validate an iterator stage name. Stage names become property key segments,
/// so they cannot contain dots.
pub fn validate_stage_name(name: &str) -> Result<()> {
    if !stage_name_pattern().is_match(name) {
        return Err(AdminError::invalid(format!(
            "Iterator name '{}' may only contain a-z, A-Z, 0-9 and _",
            name
        )));
    }
    Ok(())
}

/// Namespace part of a table name, `None` for the default namespace.
pub fn namespace_of(name: &str) -> Option<&str> {
    name.split_once('.').map(|(ns, _)| ns)
}
