//! Table Lifecycle State Machine
//!
//! ```text
//! ABSENT -> CREATING -> ONLINE <-> OFFLINE -> DELETING -> ABSENT
//!              \-- CLONING --/
//! ```
//!
//! `ABSENT` is the absence of an entry. `CREATING`, `CLONING` and `DELETING`
//! are transient: such entries hold their name (so racing creates fail with
//! `TableExists`) but are invisible to lookups, `exists` and listings.
//!
//! Names map to stable `TableId`s; rename only rebinds the name, so it is a
//! single atomic update under the caller's lock.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::{TableTime, TimestampPolicy};
use crate::error::{AdminError, Result};
use crate::names::TableId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableState {
    Creating,
    /// Creation sub-state entered only through clone.
    Cloning,
    Online,
    Offline,
    Deleting,
}

impl TableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Creating => "CREATING",
            TableState::Cloning => "CLONING",
            TableState::Online => "ONLINE",
            TableState::Offline => "OFFLINE",
            TableState::Deleting => "DELETING",
        }
    }

    /// Whether the table resolves for lookups.
    pub fn is_visible(&self) -> bool {
        matches!(self, TableState::Online | TableState::Offline)
    }

    pub fn can_transition_to(&self, to: TableState) -> bool {
        use TableState::*;
        matches!(
            (self, to),
            (Creating, Online)
                | (Cloning, Online)
                | (Online, Offline)
                | (Offline, Online)
                | (Creating, Deleting)
                | (Cloning, Deleting)
                | (Online, Deleting)
                | (Offline, Deleting)
        )
    }
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record of one table.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub id: TableId,
    pub name: String,
    pub state: TableState,
    /// Pending online/offline target, cleared once reached.
    pub goal: Option<TableState>,
    pub time: TableTime,
    pub created_at_ms: u64,
    /// Principals authorized on this table. Never copied by clone.
    pub principals: BTreeSet<String>,
}

impl TableEntry {
    fn transition(&mut self, to: TableState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(AdminError::IllegalTransition {
                table: self.name.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Name bindings and lifecycle records for all tables.
#[derive(Debug, Default)]
pub struct Lifecycle {
    names: HashMap<String, TableId>,
    entries: HashMap<TableId, TableEntry>,
    next_id: u64,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a new entry in `Creating` or `Cloning`.
    ///
    /// This is the compare-and-swap that serializes racing creations: the
    /// name is taken the moment this returns.
    pub fn reserve(
        &mut self,
        name: &str,
        state: TableState,
        policy: TimestampPolicy,
        principal: &str,
        now_ms: u64,
    ) -> Result<TableId> {
        if !matches!(state, TableState::Creating | TableState::Cloning) {
            return Err(AdminError::IllegalTransition {
                table: name.to_string(),
                from: state,
                to: TableState::Online,
            });
        }
        if self.names.contains_key(name) {
            return Err(AdminError::TableExists(name.to_string()));
        }

        let id = TableId(self.next_id);
        self.next_id += 1;

        self.names.insert(name.to_string(), id);
        self.entries.insert(
            id,
            TableEntry {
                id,
                name: name.to_string(),
                state,
                goal: None,
                time: TableTime::new(policy),
                created_at_ms: now_ms,
                principals: BTreeSet::from([principal.to_string()]),
            },
        );
        Ok(id)
    }

    /// Make a reserved table visible as `Online`.
    pub fn commit_online(&mut self, id: TableId) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| AdminError::TableNotFound(id.to_string()))?;
        entry.transition(TableState::Online)
    }

    /// Drop a reservation whose creation failed.
    pub fn abort(&mut self, id: TableId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.names.remove(&entry.name);
        }
    }

    /// Resolve a visible table.
    pub fn resolve(&self, name: &str) -> Result<&TableEntry> {
        self.names
            .get(name)
            .and_then(|id| self.entries.get(id))
            .filter(|entry| entry.state.is_visible())
            .ok_or_else(|| AdminError::TableNotFound(name.to_string()))
    }

    pub fn resolve_mut(&mut self, name: &str) -> Result<&mut TableEntry> {
        self.names
            .get(name)
            .and_then(|id| self.entries.get_mut(id))
            .filter(|entry| entry.state.is_visible())
            .ok_or_else(|| AdminError::TableNotFound(name.to_string()))
    }

    /// Entry by id, in any state.
    pub fn entry(&self, id: TableId) -> Option<&TableEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: TableId) -> Option<&mut TableEntry> {
        self.entries.get_mut(&id)
    }

    /// Resolve a visible table and require it to be in `required` state.
    pub fn require(&self, name: &str, required: TableState) -> Result<&TableEntry> {
        let entry = self.resolve(name)?;
        if entry.state != required {
            return Err(AdminError::InvalidState {
                table: name.to_string(),
                actual: entry.state,
                required,
            });
        }
        Ok(entry)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub fn visible_names(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.state.is_visible())
            .map(|e| e.name.clone())
            .collect()
    }

    /// Move a visible table to `Deleting`. From here on every lookup of the
    /// name fails with `TableNotFound`.
    pub fn begin_delete(&mut self, name: &str) -> Result<TableId> {
        let entry = self.resolve_mut(name)?;
        entry.transition(TableState::Deleting)?;
        entry.goal = None;
        Ok(entry.id)
    }

    /// Remove a `Deleting` entry and release its name.
    pub fn finish_delete(&mut self, id: TableId) -> Result<()> {
        match self.entries.get(&id) {
            Some(entry) if entry.state == TableState::Deleting => {
                let name = entry.name.clone();
                self.entries.remove(&id);
                if self.names.get(&name) == Some(&id) {
                    self.names.remove(&name);
                }
                Ok(())
            }
            Some(entry) => Err(AdminError::IllegalTransition {
                table: entry.name.clone(),
                from: entry.state,
                to: TableState::Deleting,
            }),
            None => Err(AdminError::TableNotFound(id.to_string())),
        }
    }

    /// Rebind `old` to `new` in one step.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<TableId> {
        let id = self.resolve(old)?.id;
        if self.names.contains_key(new) {
            return Err(AdminError::TableExists(new.to_string()));
        }
        self.names.remove(old);
        self.names.insert(new.to_string(), id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.name = new.to_string();
        }
        Ok(id)
    }

    /// Record an online/offline goal. Returns `None` when the table is
    /// already in `target` with nothing pending (no work to schedule).
    pub fn request_state(&mut self, name: &str, target: TableState) -> Result<Option<TableId>> {
        if !matches!(target, TableState::Online | TableState::Offline) {
            return Err(AdminError::invalid(format!("{} is not a requestable state", target)));
        }
        let entry = self.resolve_mut(name)?;
        if entry.state == target && entry.goal.is_none() {
            return Ok(None);
        }
        entry.goal = Some(target);
        Ok(Some(entry.id))
    }

    /// Apply a scheduled transition. Stale work (table deleted, or the goal
    /// changed since scheduling) is ignored and reported as `false`.
    pub fn complete_transition(&mut self, id: TableId, target: TableState) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if !entry.state.is_visible() || entry.goal != Some(target) {
            return false;
        }
        entry.goal = None;
        if entry.state == target {
            return true;
        }
        entry.transition(target).is_ok()
    }
}
