//! Property Store - per-table versioned string configuration
//!
//! Every table owns one `PropertyMap`. Writes are last-writer-wins and are
//! visible to the next read on the same table. All key/value validation
//! happens here, at the store boundary; iterator configuration keys
//! (`table.iterator.*`) are additionally checked by the iterator registry's
//! parser so a malformed stage can never be stored.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{AdminError, Result};
use crate::iterators;
use crate::names::TableId;

/// Ordered property mapping for one table.
pub type PropertyMap = BTreeMap<String, String>;

/// Validate a single property entry
///
/// Keys: non-empty, no whitespace or control characters.
/// Values: may be empty, no control characters.
pub fn validate_property(key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(AdminError::invalid("Property key must not be empty"));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AdminError::invalid(format!(
            "Property key '{}' contains whitespace or control characters",
            key.escape_debug()
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(AdminError::invalid(format!(
            "Value of property '{}' contains control characters",
            key
        )));
    }
    if iterators::is_iterator_key(key) {
        iterators::validate_iterator_property(key, value)?;
    }
    Ok(())
}

/// Compose the property set of a clone.
///
/// `(source \ exclude) ∪ overrides`, where overrides are applied after the
/// exclusion and win on key collision.
pub fn compose_clone(
    source: &PropertyMap,
    exclude: &BTreeSet<String>,
    overrides: &PropertyMap,
) -> Result<PropertyMap> {
    for (key, value) in overrides {
        validate_property(key, value)?;
    }

    let mut props: PropertyMap = source
        .iter()
        .filter(|(key, _)| !exclude.contains(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    props.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(props)
}

/// Property maps for every live table, keyed by table id.
#[derive(Debug, Default)]
pub struct PropertyStore {
    tables: HashMap<TableId, PropertyMap>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with an initial property set. Entries are validated.
    pub fn register(&mut self, id: TableId, initial: PropertyMap) -> Result<()> {
        for (key, value) in &initial {
            validate_property(key, value)?;
        }
        self.tables.insert(id, initial);
        Ok(())
    }

    /// Forget a table's properties (table deletion).
    pub fn unregister(&mut self, id: TableId) -> Option<PropertyMap> {
        self.tables.remove(&id)
    }

    /// Borrow a table's property map.
    pub fn map(&self, id: TableId) -> Result<&PropertyMap> {
        self.tables
            .get(&id)
            .ok_or_else(|| AdminError::TableNotFound(id.to_string()))
    }

    /// Snapshot of a table's properties.
    pub fn get(&self, id: TableId) -> Result<PropertyMap> {
        self.map(id).cloned()
    }

    /// Set one property, replacing any previous value.
    pub fn set(&mut self, id: TableId, key: &str, value: &str) -> Result<()> {
        validate_property(key, value)?;
        let props = self.map_mut(id)?;
        props.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Set several properties at once. Nothing is written unless every
    /// entry validates.
    pub fn set_all(&mut self, id: TableId, entries: &PropertyMap) -> Result<()> {
        for (key, value) in entries {
            validate_property(key, value)?;
        }
        let props = self.map_mut(id)?;
        props.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    /// Remove one property. Removing an absent key is a no-op.
    pub fn remove(&mut self, id: TableId, key: &str) -> Result<Option<String>> {
        if key.is_empty() {
            return Err(AdminError::invalid("Property key must not be empty"));
        }
        Ok(self.map_mut(id)?.remove(key))
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn remove_prefix(&mut self, id: TableId, prefix: &str) -> Result<usize> {
        let props = self.map_mut(id)?;
        let before = props.len();
        props.retain(|key, _| !key.starts_with(prefix));
        Ok(before - props.len())
    }

    fn map_mut(&mut self, id: TableId) -> Result<&mut PropertyMap> {
        self.tables
            .get_mut(&id)
            .ok_or_else(|| AdminError::TableNotFound(id.to_string()))
    }
}
