//! Iterator Pipeline Registry
//!
//! A table's processing pipeline is an ordered chain of named stages per
//! scope (minor compaction, major compaction, scan). The registry keeps no
//! state of its own: stages live in the table's `PropertyMap` under
//!
//! ```text
//! table.iterator.<scope>.<name>            = <priority>,<class>
//! table.iterator.<scope>.<name>.opt.<key>  = <value>
//! table.iterator.<scope>.<name>.seq        = <insertion sequence>
//! ```
//!
//! so clone, export and import carry pipelines along with the rest of the
//! configuration. Stages run in (priority asc, insertion order asc).
//!
//! Stage logic is opaque to the control plane except for the built-in
//! versioning stage, which `apply()` executes so the retention policy has an
//! observable effect on flush, compaction and scan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AdminError, Result};
use crate::names::{validate_stage_name, TableId};
use crate::properties::{PropertyMap, PropertyStore};
use crate::tablet::Cell;

pub const ITERATOR_PREFIX: &str = "table.iterator.";

pub const VERSIONING_ITERATOR_NAME: &str = "vers";
pub const VERSIONING_ITERATOR_CLASS: &str = "tablet.iterators.VersioningIterator";
pub const VERSIONING_ITERATOR_PRIORITY: i32 = 10;
pub const MAX_VERSIONS_OPTION: &str = "maxVersions";

/// Point in the data path where a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IteratorScope {
    /// Minor compaction (memtable flush)
    Minc,
    /// Major compaction (file merge)
    Majc,
    /// Read time
    Scan,
}

impl IteratorScope {
    pub const ALL: [IteratorScope; 3] = [IteratorScope::Minc, IteratorScope::Majc, IteratorScope::Scan];

    pub fn as_str(&self) -> &'static str {
        match self {
            IteratorScope::Minc => "minc",
            IteratorScope::Majc => "majc",
            IteratorScope::Scan => "scan",
        }
    }

    pub fn all() -> BTreeSet<IteratorScope> {
        Self::ALL.into_iter().collect()
    }
}

impl fmt::Display for IteratorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IteratorScope {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minc" => Ok(IteratorScope::Minc),
            "majc" => Ok(IteratorScope::Majc),
            "scan" => Ok(IteratorScope::Scan),
            other => Err(AdminError::invalid(format!("Unknown iterator scope '{}'", other))),
        }
    }
}

/// One stage of a table's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IteratorSetting {
    pub name: String,
    /// Opaque identifier of the processing logic.
    pub class_name: String,
    /// Lower runs earlier.
    pub priority: i32,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl IteratorSetting {
    pub fn new(priority: i32, name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            priority,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// The built-in versioning stage retaining `max_versions` versions per cell.
    pub fn versioning(max_versions: u32) -> Self {
        Self::new(VERSIONING_ITERATOR_PRIORITY, VERSIONING_ITERATOR_NAME, VERSIONING_ITERATOR_CLASS)
            .with_option(MAX_VERSIONS_OPTION, max_versions.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        validate_stage_name(&self.name)?;
        validate_class_name(&self.class_name)?;
        for (key, value) in &self.options {
            validate_option(key, value)?;
        }
        Ok(())
    }

    fn max_versions(&self) -> Option<u32> {
        self.options.get(MAX_VERSIONS_OPTION).and_then(|v| v.parse().ok())
    }
}

// ============================================================================
// Property key grammar
// ============================================================================

enum IteratorKey<'a> {
    Stage { scope: IteratorScope, name: &'a str },
    Option { scope: IteratorScope, name: &'a str, option: &'a str },
    Sequence { scope: IteratorScope, name: &'a str },
}

pub fn is_iterator_key(key: &str) -> bool {
    key.starts_with(ITERATOR_PREFIX)
}

fn stage_key(scope: IteratorScope, name: &str) -> String {
    format!("{}{}.{}", ITERATOR_PREFIX, scope, name)
}

fn parse_iterator_key(key: &str) -> Result<IteratorKey<'_>> {
    let rest = key
        .strip_prefix(ITERATOR_PREFIX)
        .ok_or_else(|| AdminError::invalid(format!("'{}' is not an iterator key", key)))?;
    let (scope, rest) = rest
        .split_once('.')
        .ok_or_else(|| AdminError::invalid(format!("Iterator key '{}' has no stage name", key)))?;
    let scope: IteratorScope = scope.parse()?;

    match rest.split_once('.') {
        None => {
            validate_stage_name(rest)?;
            Ok(IteratorKey::Stage { scope, name: rest })
        }
        Some((name, "seq")) => {
            validate_stage_name(name)?;
            Ok(IteratorKey::Sequence { scope, name })
        }
        Some((name, suffix)) => {
            validate_stage_name(name)?;
            match suffix.strip_prefix("opt.") {
                Some(option) if !option.is_empty() => Ok(IteratorKey::Option { scope, name, option }),
                _ => Err(AdminError::invalid(format!("Malformed iterator key '{}'", key))),
            }
        }
    }
}

fn parse_stage_value(value: &str) -> Result<(i32, &str)> {
    let (priority, class_name) = value.split_once(',').ok_or_else(|| {
        AdminError::invalid(format!("Iterator entry '{}' must be '<priority>,<class>'", value))
    })?;
    let priority = priority
        .trim()
        .parse::<i32>()
        .map_err(|_| AdminError::invalid(format!("Invalid iterator priority '{}'", priority)))?;
    validate_class_name(class_name)?;
    Ok((priority, class_name))
}

fn validate_class_name(class_name: &str) -> Result<()> {
    if class_name.is_empty() || class_name.chars().any(|c| c.is_whitespace() || c == ',') {
        return Err(AdminError::invalid(format!("Invalid iterator class '{}'", class_name)));
    }
    Ok(())
}

fn validate_option(key: &str, value: &str) -> Result<()> {
    if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AdminError::invalid(format!("Invalid iterator option name '{}'", key)));
    }
    if key == MAX_VERSIONS_OPTION {
        match value.parse::<u32>() {
            Ok(k) if k >= 1 => {}
            _ => {
                return Err(AdminError::invalid(format!(
                    "{} must be a positive integer, got '{}'",
                    MAX_VERSIONS_OPTION, value
                )))
            }
        }
    }
    Ok(())
}

/// Validate a `table.iterator.*` property entry.
pub fn validate_iterator_property(key: &str, value: &str) -> Result<()> {
    match parse_iterator_key(key)? {
        IteratorKey::Stage { .. } => parse_stage_value(value).map(|_| ()),
        IteratorKey::Option { option, .. } => validate_option(option, value),
        IteratorKey::Sequence { .. } => value
            .parse::<u64>()
            .map(|_| ())
            .map_err(|_| AdminError::invalid(format!("Invalid iterator sequence '{}'", value))),
    }
}

/// Property entries describing `setting` in `scope`.
fn stage_entries(scope: IteratorScope, setting: &IteratorSetting, seq: u64) -> PropertyMap {
    let base = stage_key(scope, &setting.name);
    let mut entries = PropertyMap::new();
    entries.insert(base.clone(), format!("{},{}", setting.priority, setting.class_name));
    for (key, value) in &setting.options {
        entries.insert(format!("{}.opt.{}", base, key), value.clone());
    }
    entries.insert(format!("{}.seq", base), seq.to_string());
    entries
}

fn next_sequence(props: &PropertyMap) -> u64 {
    props
        .range(ITERATOR_PREFIX.to_string()..)
        .take_while(|(key, _)| key.starts_with(ITERATOR_PREFIX))
        .filter(|(key, _)| key.ends_with(".seq"))
        .filter_map(|(_, value)| value.parse::<u64>().ok())
        .max()
        .map_or(0, |max| max + 1)
}

// ============================================================================
// Registry operations
// ============================================================================

/// Attach a stage to the given scopes of a table.
///
/// Fails with `IteratorConflict` if a stage of the same name exists in any
/// requested scope; nothing is written in that case.
pub fn attach(
    store: &mut PropertyStore,
    id: TableId,
    table: &str,
    setting: &IteratorSetting,
    scopes: &BTreeSet<IteratorScope>,
) -> Result<()> {
    if scopes.is_empty() {
        return Err(AdminError::invalid("At least one iterator scope is required"));
    }
    setting.validate()?;

    let props = store.map(id)?;
    for scope in scopes {
        if props.contains_key(&stage_key(*scope, &setting.name)) {
            return Err(AdminError::IteratorConflict {
                table: table.to_string(),
                name: setting.name.clone(),
                scope: *scope,
            });
        }
    }

    let seq = next_sequence(props);
    let mut entries = PropertyMap::new();
    for scope in scopes {
        entries.extend(stage_entries(*scope, setting, seq));
    }
    store.set_all(id, &entries)
}

/// Remove a named stage from one scope.
pub fn remove(
    store: &mut PropertyStore,
    id: TableId,
    table: &str,
    name: &str,
    scope: IteratorScope,
) -> Result<()> {
    let key = stage_key(scope, name);
    if !store.map(id)?.contains_key(&key) {
        return Err(AdminError::IteratorNotFound {
            table: table.to_string(),
            name: name.to_string(),
            scope,
        });
    }
    store.remove_prefix(id, &format!("{}.", key))?;
    store.remove(id, &key)?;
    Ok(())
}

/// Stages configured for `scope`, in execution order.
///
/// Entries that fail to parse (written before validation existed, or by
/// hand) are skipped with a warning rather than failing the listing.
pub fn list(props: &PropertyMap, scope: IteratorScope) -> Vec<IteratorSetting> {
    let prefix = format!("{}{}.", ITERATOR_PREFIX, scope);
    let mut stages: BTreeMap<&str, (IteratorSetting, u64)> = BTreeMap::new();
    let mut options: Vec<(&str, &str, &str)> = Vec::new();
    let mut sequences: BTreeMap<&str, u64> = BTreeMap::new();

    for (key, value) in props.range(prefix.clone()..).take_while(|(k, _)| k.starts_with(&prefix)) {
        match parse_iterator_key(key) {
            Ok(IteratorKey::Stage { name, .. }) => match parse_stage_value(value) {
                Ok((priority, class_name)) => {
                    stages.insert(name, (IteratorSetting::new(priority, name, class_name), u64::MAX));
                }
                Err(e) => tracing::warn!("skipping iterator '{}': {}", key, e),
            },
            Ok(IteratorKey::Option { name, option, .. }) => options.push((name, option, value)),
            Ok(IteratorKey::Sequence { name, .. }) => {
                if let Ok(seq) = value.parse::<u64>() {
                    sequences.insert(name, seq);
                }
            }
            Err(e) => tracing::warn!("skipping iterator property '{}': {}", key, e),
        }
    }

    for (name, option, value) in options {
        if let Some((setting, _)) = stages.get_mut(name) {
            setting.options.insert(option.to_string(), value.to_string());
        }
    }
    for (name, seq) in sequences {
        if let Some((_, slot)) = stages.get_mut(name) {
            *slot = seq;
        }
    }

    let mut ordered: Vec<(IteratorSetting, u64)> = stages.into_values().collect();
    ordered.sort_by(|(a, a_seq), (b, b_seq)| {
        a.priority.cmp(&b.priority).then(a_seq.cmp(b_seq)).then(a.name.cmp(&b.name))
    });
    ordered.into_iter().map(|(setting, _)| setting).collect()
}

/// Pipelines of every scope.
pub fn list_all(props: &PropertyMap) -> BTreeMap<IteratorScope, Vec<IteratorSetting>> {
    IteratorScope::ALL
        .into_iter()
        .map(|scope| (scope, list(props, scope)))
        .collect()
}

/// Configure version retention: keep at most `max_versions` versions of each
/// cell in all three scopes. Reconfigures the existing versioning stage or
/// attaches the built-in one where a scope lacks it. A stage named `vers`
/// with some other class is replaced, options included.
pub fn set_max_versions(store: &mut PropertyStore, id: TableId, max_versions: u32) -> Result<()> {
    if max_versions == 0 {
        return Err(AdminError::invalid("maxVersions must be at least 1"));
    }

    let props = store.map(id)?;
    let mut seq = None;
    let mut replaced = Vec::new();
    let mut entries = PropertyMap::new();
    for scope in IteratorScope::ALL {
        let key = stage_key(scope, VERSIONING_ITERATOR_NAME);
        let existing = props.get(&key).map(|value| parse_stage_value(value));
        match existing {
            Some(Ok((_, VERSIONING_ITERATOR_CLASS))) => {
                entries.insert(format!("{}.opt.{}", key, MAX_VERSIONS_OPTION), max_versions.to_string());
            }
            other => {
                if let Some(found) = other {
                    tracing::debug!("replacing '{}' ({:?}) with the versioning stage", key, found);
                    replaced.push(key);
                }
                let seq = *seq.get_or_insert_with(|| next_sequence(props));
                entries.extend(stage_entries(scope, &IteratorSetting::versioning(max_versions), seq));
            }
        }
    }

    for key in replaced {
        store.remove_prefix(id, &format!("{}.", key))?;
    }
    store.set_all(id, &entries)
}

// ============================================================================
// Stage application
// ============================================================================

/// Run a pipeline over `cells`.
///
/// Input is in write order; only the relative order of cells with equal
/// (row, column, timestamp) matters, the later one counting as newer.
/// Output is in scan order: (row, column) ascending, newest first.
pub fn apply(stages: &[IteratorSetting], mut cells: Vec<Cell>) -> Vec<Cell> {
    cells.reverse();
    cells.sort_by(|a, b| {
        (&a.row, &a.column, Reverse(a.timestamp)).cmp(&(&b.row, &b.column, Reverse(b.timestamp)))
    });

    for stage in stages {
        cells = match stage.class_name.as_str() {
            VERSIONING_ITERATOR_CLASS => match stage.max_versions() {
                Some(k) => retain_versions(cells, k as usize),
                None => {
                    tracing::warn!("versioning stage '{}' has no valid {}", stage.name, MAX_VERSIONS_OPTION);
                    cells
                }
            },
            other => {
                tracing::trace!("stage '{}' ({}) runs in the storage engine", stage.name, other);
                cells
            }
        };
    }
    cells
}

/// Keep the first `k` cells of every (row, column) run. Expects scan order.
fn retain_versions(cells: Vec<Cell>, k: usize) -> Vec<Cell> {
    let mut kept: Vec<Cell> = Vec::with_capacity(cells.len());
    let mut run = 0usize;
    for cell in cells {
        let same_key = kept
            .last()
            .map_or(false, |prev| prev.row == cell.row && prev.column == cell.column);
        run = if same_key { run + 1 } else { 1 };
        if run <= k {
            kept.push(cell);
        }
    }
    kept
}
