//! TableManager - authoritative table catalog of the tablet store
//!
//! This is the service side of the admin protocol: it owns every table's
//! lifecycle record, properties, iterator pipelines and cell storage, and
//! enforces the cross-operation rules (export needs an offline table,
//! deleted names stop resolving, names are reserved before a table becomes
//! visible).
//!
//! # Architecture
//!
//! - `Catalog` holds `Lifecycle` + `PropertyStore` + per-table `TabletData`
//!   behind a single `RwLock`; each operation is a short sequence of critical
//!   sections
//! - Name reservation (`Lifecycle::reserve`) is the compare-and-swap that
//!   serializes racing create/clone/import of the same name
//! - Online/offline requests record a goal and are completed asynchronously
//!   by a transition worker thread fed over a channel, so "requested" and
//!   "observed" states can differ until the worker catches up
//!
//! # Usage
//!
//! ```no_run
//! use tablet_admin::catalog::{CreateOptions, TableManager};
//!
//! let manager = TableManager::new();
//! manager.create_table("trades", &CreateOptions::default(), "root").unwrap();
//! assert!(manager.exists("trades"));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock, TableTime, TimestampPolicy};
use crate::config::ServerConfig;
use crate::error::{AdminError, Result};
use crate::iterators::{self, IteratorScope, IteratorSetting};
use crate::lifecycle::{Lifecycle, TableState};
use crate::manifest::{ExportManifest, ExportedFile, MANIFEST_FORMAT_VERSION};
use crate::names::{namespace_of, validate_table_name, TableId};
use crate::properties::{self, PropertyMap, PropertyStore};
use crate::tablet::{Cell, FlushResult, TabletData};

/// Options for `create_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOptions {
    /// Register the default versioning stage (1 version, all scopes).
    pub versioning: bool,
    pub timestamp_policy: TimestampPolicy,
    /// Initial properties, applied before the versioning default.
    pub properties: PropertyMap,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            versioning: true,
            timestamp_policy: TimestampPolicy::WallClock,
            properties: PropertyMap::new(),
        }
    }
}

/// Options for `clone_table`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloneOptions {
    /// Flush the source's memtable before the snapshot. Without it, unflushed
    /// writes are not part of the clone.
    pub flush: bool,
    /// Applied after exclusion; wins over copied values.
    pub set_properties: PropertyMap,
    pub exclude_properties: BTreeSet<String>,
}

/// One write to a table; the service assigns the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub row: String,
    pub column: String,
    pub value: String,
}

impl Mutation {
    pub fn new(row: impl Into<String>, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Tables sharing storage and the bytes attributable to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub tables: BTreeSet<String>,
    pub usage_bytes: u64,
}

/// Table information for the TableInfo response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub namespace: Option<String>,
    pub state: TableState,
    pub goal: Option<TableState>,
    pub timestamp_policy: TimestampPolicy,
    pub logical_time: u64,
    pub created_at_ms: u64,
    pub principals: BTreeSet<String>,
    pub file_count: usize,
    pub tablet_count: usize,
}

/// Everything guarded by the manager's lock.
#[derive(Debug, Default)]
struct Catalog {
    lifecycle: Lifecycle,
    properties: PropertyStore,
    data: HashMap<TableId, TabletData>,
}

impl Catalog {
    fn stages(&self, id: TableId, scope: IteratorScope) -> Result<Vec<IteratorSetting>> {
        Ok(iterators::list(self.properties.map(id)?, scope))
    }

    fn data_mut(&mut self, id: TableId) -> Result<&mut TabletData> {
        self.data
            .get_mut(&id)
            .ok_or_else(|| AdminError::TableNotFound(id.to_string()))
    }

    fn data(&self, id: TableId) -> Result<&TabletData> {
        self.data
            .get(&id)
            .ok_or_else(|| AdminError::TableNotFound(id.to_string()))
    }

    fn flush_table(&mut self, id: TableId) -> Result<FlushResult> {
        let minc = self.stages(id, IteratorScope::Minc)?;
        Ok(self.data_mut(id)?.flush(id, &minc))
    }

    /// Release everything a failed creation registered.
    fn discard(&mut self, id: TableId) {
        self.lifecycle.abort(id);
        self.properties.unregister(id);
        self.data.remove(&id);
    }

    /// Apply a scheduled online/offline transition. Going offline flushes the
    /// memtable first, so an offline table holds no unflushed data.
    fn complete_transition(&mut self, transition: Transition) {
        let Transition { id, target } = transition;
        let pending = self
            .lifecycle
            .entry(id)
            .map_or(false, |e| e.state.is_visible() && e.goal == Some(target));
        if !pending {
            tracing::debug!("dropping stale transition of {} to {}", id, target);
            return;
        }

        if target == TableState::Offline {
            if let Err(e) = self.flush_table(id) {
                tracing::warn!("flush before offline failed for {}: {}", id, e);
            }
        }
        if self.lifecycle.complete_transition(id, target) {
            if let Some(entry) = self.lifecycle.entry(id) {
                tracing::info!("table '{}' is now {}", entry.name, target);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    id: TableId,
    target: TableState,
}

fn run_transition_worker(catalog: Arc<RwLock<Catalog>>, rx: Receiver<Transition>, delay: Duration) {
    for transition in rx.iter() {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut guard = catalog.write().unwrap_or_else(PoisonError::into_inner);
        guard.complete_transition(transition);
    }
    tracing::debug!("transition worker stopped");
}

/// TableManager - owns all tables of one tablet store
pub struct TableManager {
    catalog: Arc<RwLock<Catalog>>,
    clock: Arc<dyn Clock>,
    transitions: Sender<Transition>,
}

impl Default for TableManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TableManager {
    /// Manager on the system clock with immediate online/offline transitions.
    pub fn new() -> Self {
        Self::with_options(Arc::new(SystemClock), Duration::ZERO)
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::with_options(Arc::new(SystemClock), config.transition_delay())
    }

    /// # Arguments
    /// * `clock` - Wall clock for `WallClock` tables and creation times
    /// * `transition_delay` - How long an online/offline request takes to be
    ///   observed
    pub fn with_options(clock: Arc<dyn Clock>, transition_delay: Duration) -> Self {
        let catalog = Arc::new(RwLock::new(Catalog::default()));
        let (tx, rx) = crossbeam_channel::unbounded();

        let worker_catalog = Arc::clone(&catalog);
        thread::spawn(move || run_transition_worker(worker_catalog, rx, transition_delay));

        Self {
            catalog,
            clock,
            transitions: tx,
        }
    }

    fn lock_read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a new table
    ///
    /// The name is reserved in `Creating` first; properties and the default
    /// versioning stage are registered before the table becomes visible as
    /// `Online`.
    pub fn create_table(&self, name: &str, options: &CreateOptions, principal: &str) -> Result<()> {
        validate_table_name(name)?;
        let now = self.clock.now_millis();

        let id = self.lock_write().lifecycle.reserve(
            name,
            TableState::Creating,
            options.timestamp_policy,
            principal,
            now,
        )?;

        let mut catalog = self.lock_write();
        let configured = (|| -> Result<()> {
            catalog.properties.register(id, options.properties.clone())?;
            if options.versioning {
                iterators::set_max_versions(&mut catalog.properties, id, 1)?;
            }
            catalog.data.insert(id, TabletData::new());
            catalog.lifecycle.commit_online(id)
        })();

        if let Err(e) = configured {
            catalog.discard(id);
            return Err(e);
        }
        tracing::info!("created table '{}' ({}, {} timestamps)", name, id, options.timestamp_policy);
        Ok(())
    }

    /// Clone `source` into a new table `target`
    ///
    /// Copies properties (minus exclusions, plus overrides), pipelines,
    /// splits, logical time and flushed data files. Access is not copied:
    /// `principal` becomes the clone's only authorized principal.
    pub fn clone_table(
        &self,
        source: &str,
        target: &str,
        options: &CloneOptions,
        principal: &str,
    ) -> Result<()> {
        validate_table_name(target)?;
        let now = self.clock.now_millis();

        let policy = self.lock_read().lifecycle.resolve(source)?.time.policy();
        let id = self
            .lock_write()
            .lifecycle
            .reserve(target, TableState::Cloning, policy, principal, now)?;

        let mut catalog = self.lock_write();
        let cloned = (|| -> Result<()> {
            let src = catalog.lifecycle.resolve(source)?;
            let (src_id, src_state, src_time) = (src.id, src.state, src.time);

            if options.flush && src_state == TableState::Online {
                let flushed = catalog.flush_table(src_id)?;
                tracing::debug!("flushed '{}' before clone: {:?}", source, flushed);
            } else if catalog.data(src_id)?.has_unflushed() {
                tracing::debug!("cloning '{}' without flush; unflushed writes are not copied", source);
            }

            let props = properties::compose_clone(
                catalog.properties.map(src_id)?,
                &options.exclude_properties,
                &options.set_properties,
            )?;
            let snapshot = catalog.data(src_id)?.snapshot_flushed();

            catalog.properties.register(id, props)?;
            catalog.data.insert(id, snapshot);
            if let Some(entry) = catalog.lifecycle.entry_mut(id) {
                entry.time = TableTime::restore(src_time.policy(), src_time.last());
            }
            catalog.lifecycle.commit_online(id)
        })();

        if let Err(e) = cloned {
            catalog.discard(id);
            return Err(e);
        }
        tracing::info!("cloned table '{}' into '{}' ({})", source, target, id);
        Ok(())
    }

    /// Delete a table. Irreversible.
    ///
    /// The table moves to `Deleting` first; from then on every operation
    /// naming it fails with `TableNotFound`.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let id = self.lock_write().lifecycle.begin_delete(name)?;

        let mut catalog = self.lock_write();
        catalog.properties.unregister(id);
        // Dropping the data releases this table's references to shared files
        catalog.data.remove(&id);
        catalog.lifecycle.finish_delete(id)?;

        tracing::info!("deleted table '{}' ({})", name, id);
        Ok(())
    }

    /// Rename atomically: no observer sees both or neither name.
    pub fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        validate_table_name(new)?;
        let id = self.lock_write().lifecycle.rename(old, new)?;
        tracing::info!("renamed table '{}' to '{}' ({})", old, new, id);
        Ok(())
    }

    /// Request that a table come online. Returns once the request is queued.
    pub fn set_online(&self, name: &str) -> Result<()> {
        self.request_state(name, TableState::Online)
    }

    /// Request that a table go offline. Returns once the request is queued.
    pub fn set_offline(&self, name: &str) -> Result<()> {
        self.request_state(name, TableState::Offline)
    }

    fn request_state(&self, name: &str, target: TableState) -> Result<()> {
        let scheduled = self.lock_write().lifecycle.request_state(name, target)?;
        if let Some(id) = scheduled {
            self.transitions
                .send(Transition { id, target })
                .map_err(|_| AdminError::Internal("transition worker stopped".to_string()))?;
            tracing::debug!("queued transition of '{}' to {}", name, target);
        }
        Ok(())
    }

    /// Current observed state of a visible table.
    pub fn table_state(&self, name: &str) -> Result<TableState> {
        Ok(self.lock_read().lifecycle.resolve(name)?.state)
    }

    pub fn table_info(&self, name: &str) -> Result<TableInfo> {
        let catalog = self.lock_read();
        let entry = catalog.lifecycle.resolve(name)?;
        let data = catalog.data(entry.id)?;
        Ok(TableInfo {
            name: entry.name.clone(),
            namespace: namespace_of(&entry.name).map(str::to_string),
            state: entry.state,
            goal: entry.goal,
            timestamp_policy: entry.time.policy(),
            logical_time: entry.time.last(),
            created_at_ms: entry.created_at_ms,
            principals: entry.principals.clone(),
            file_count: data.files().len(),
            tablet_count: data.tablet_count(),
        })
    }

    /// Authorize another principal on a table.
    pub fn grant_access(&self, name: &str, principal: &str) -> Result<()> {
        if principal.is_empty() {
            return Err(AdminError::invalid("Principal must not be empty"));
        }
        self.lock_write()
            .lifecycle
            .resolve_mut(name)?
            .principals
            .insert(principal.to_string());
        Ok(())
    }

    /// Check if a table exists (visible as online or offline)
    pub fn exists(&self, name: &str) -> bool {
        self.lock_read().lifecycle.exists(name)
    }

    /// List all visible tables
    pub fn list_tables(&self) -> BTreeSet<String> {
        self.lock_read().lifecycle.visible_names()
    }

    // ========================================================================
    // Export / Import
    // ========================================================================

    /// Export an offline table's configuration into `dir`.
    ///
    /// The caller must keep the table offline while it copies the files
    /// listed in `files.txt`; nothing here prevents them from being
    /// compacted away once the table is back online.
    pub fn export_table(&self, name: &str, dir: &Path) -> Result<ExportManifest> {
        let manifest = {
            let catalog = self.lock_read();
            let entry = catalog.lifecycle.require(name, TableState::Offline)?;
            let props = catalog.properties.get(entry.id)?;
            let data = catalog.data(entry.id)?;
            ExportManifest {
                format_version: MANIFEST_FORMAT_VERSION,
                table_name: entry.name.clone(),
                timestamp_policy: entry.time.policy(),
                logical_time: entry.time.last(),
                exported_at_ms: self.clock.now_millis(),
                iterators: iterators::list_all(&props),
                properties: props,
                splits: data.splits().clone(),
                files: data
                    .files()
                    .iter()
                    .map(|f| ExportedFile {
                        id: f.id.clone(),
                        size_bytes: f.size_bytes,
                    })
                    .collect(),
            }
        };

        let path = manifest.write_to(dir)?;
        tracing::info!("exported table '{}' to {}", name, path.display());
        Ok(manifest)
    }

    /// Create `name` from a manifest written by `export_table`.
    ///
    /// Restores properties, pipelines, splits, timestamp policy and logical
    /// time. Data files listed by the export are not loaded.
    pub fn import_table(&self, name: &str, dir: &Path, principal: &str) -> Result<()> {
        validate_table_name(name)?;
        let manifest = ExportManifest::read_from(dir)?;
        let now = self.clock.now_millis();

        let id = self.lock_write().lifecycle.reserve(
            name,
            TableState::Creating,
            manifest.timestamp_policy,
            principal,
            now,
        )?;

        let mut catalog = self.lock_write();
        let imported = (|| -> Result<()> {
            catalog.properties.register(id, manifest.properties.clone())?;
            catalog.data.insert(id, TabletData::with_splits(manifest.splits.clone()));
            if let Some(entry) = catalog.lifecycle.entry_mut(id) {
                entry.time = TableTime::restore(manifest.timestamp_policy, manifest.logical_time);
            }
            catalog.lifecycle.commit_online(id)
        })();

        if let Err(e) = imported {
            catalog.discard(id);
            return Err(e);
        }
        tracing::info!(
            "imported table '{}' from {} (exported as '{}')",
            name,
            dir.display(),
            manifest.table_name
        );
        Ok(())
    }

    // ========================================================================
    // Disk usage
    // ========================================================================

    /// Group the named tables by shared data files.
    ///
    /// Tables sharing any file (directly or through another requested table)
    /// form one record; its usage counts each distinct file once. Every
    /// requested table appears in exactly one record.
    pub fn disk_usage(&self, names: &BTreeSet<String>) -> Result<Vec<DiskUsage>> {
        let catalog = self.lock_read();

        let mut tables: Vec<(&str, TableId)> = Vec::with_capacity(names.len());
        for name in names {
            tables.push((name.as_str(), catalog.lifecycle.resolve(name)?.id));
        }

        // Union-find over table indices, joined through shared file ids
        let mut parent: Vec<usize> = (0..tables.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut file_owner: HashMap<&str, usize> = HashMap::new();
        let mut file_size: HashMap<&str, u64> = HashMap::new();
        for (idx, (_, id)) in tables.iter().enumerate() {
            for file in catalog.data(*id)?.files() {
                file_size.insert(file.id.as_str(), file.size_bytes);
                match file_owner.get(file.id.as_str()) {
                    Some(&other) => {
                        let (a, b) = (find(&mut parent, idx), find(&mut parent, other));
                        if a != b {
                            parent[a] = b;
                        }
                    }
                    None => {
                        file_owner.insert(file.id.as_str(), idx);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, (BTreeSet<String>, BTreeSet<&str>)> = BTreeMap::new();
        for (idx, (name, id)) in tables.iter().enumerate() {
            let root = find(&mut parent, idx);
            let group = groups.entry(root).or_default();
            group.0.insert(name.to_string());
            for file in catalog.data(*id)?.files() {
                group.1.insert(file.id.as_str());
            }
        }

        let mut usage: Vec<DiskUsage> = groups
            .into_values()
            .map(|(tables, files)| DiskUsage {
                usage_bytes: files.iter().filter_map(|f| file_size.get(f)).sum(),
                tables,
            })
            .collect();
        usage.sort_by(|a, b| a.tables.cmp(&b.tables));
        Ok(usage)
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub fn get_properties(&self, name: &str) -> Result<PropertyMap> {
        let catalog = self.lock_read();
        let id = catalog.lifecycle.resolve(name)?.id;
        catalog.properties.get(id)
    }

    pub fn set_property(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.resolve(name)?.id;
        catalog.properties.set(id, key, value)
    }

    pub fn remove_property(&self, name: &str, key: &str) -> Result<()> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.resolve(name)?.id;
        catalog.properties.remove(id, key).map(|_| ())
    }

    // ========================================================================
    // Iterators
    // ========================================================================

    pub fn attach_iterator(
        &self,
        name: &str,
        setting: &IteratorSetting,
        scopes: &BTreeSet<IteratorScope>,
    ) -> Result<()> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.resolve(name)?.id;
        iterators::attach(&mut catalog.properties, id, name, setting, scopes)
    }

    pub fn remove_iterator(&self, name: &str, stage: &str, scope: IteratorScope) -> Result<()> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.resolve(name)?.id;
        iterators::remove(&mut catalog.properties, id, name, stage, scope)
    }

    pub fn list_iterators(&self, name: &str, scope: IteratorScope) -> Result<Vec<IteratorSetting>> {
        let catalog = self.lock_read();
        let id = catalog.lifecycle.resolve(name)?.id;
        catalog.stages(id, scope)
    }

    /// Keep at most `max_versions` versions of every cell, in all scopes.
    pub fn set_max_versions(&self, name: &str, max_versions: u32) -> Result<()> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.resolve(name)?.id;
        iterators::set_max_versions(&mut catalog.properties, id, max_versions)
    }

    // ========================================================================
    // Splits
    // ========================================================================

    pub fn add_splits(&self, name: &str, splits: &BTreeSet<String>) -> Result<usize> {
        if splits.iter().any(String::is_empty) {
            return Err(AdminError::invalid("Split points must not be empty"));
        }
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.resolve(name)?.id;
        Ok(catalog.data_mut(id)?.add_splits(splits.iter().cloned()))
    }

    pub fn list_splits(&self, name: &str) -> Result<BTreeSet<String>> {
        let catalog = self.lock_read();
        let id = catalog.lifecycle.resolve(name)?.id;
        Ok(catalog.data(id)?.splits().clone())
    }

    // ========================================================================
    // Data path
    // ========================================================================

    /// Apply mutations to an online table. Returns the assigned timestamps.
    pub fn write(&self, name: &str, mutations: &[Mutation]) -> Result<Vec<u64>> {
        if mutations.iter().any(|m| m.row.is_empty()) {
            return Err(AdminError::invalid("Mutation row must not be empty"));
        }

        let mut guard = self.lock_write();
        let catalog = &mut *guard;
        let id = catalog.lifecycle.require(name, TableState::Online)?.id;
        let entry = catalog
            .lifecycle
            .entry_mut(id)
            .ok_or_else(|| AdminError::TableNotFound(name.to_string()))?;
        let data = catalog
            .data
            .get_mut(&id)
            .ok_or_else(|| AdminError::TableNotFound(name.to_string()))?;

        // Assign every timestamp before applying any mutation
        let mut time = entry.time;
        let timestamps = mutations
            .iter()
            .map(|_| time.next(self.clock.as_ref()))
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| AdminError::TimestampsExhausted(name.to_string()))?;
        entry.time = time;

        for (m, ts) in mutations.iter().zip(&timestamps) {
            data.write(Cell::new(m.row.clone(), m.column.clone(), *ts, m.value.clone()));
        }
        Ok(timestamps)
    }

    /// Read an online table through its SCAN pipeline.
    pub fn scan(&self, name: &str) -> Result<Vec<Cell>> {
        let catalog = self.lock_read();
        let id = catalog.lifecycle.require(name, TableState::Online)?.id;
        let stages = catalog.stages(id, IteratorScope::Scan)?;
        Ok(catalog.data(id)?.scan(&stages))
    }

    /// Minor-compact the memtable through the MINC pipeline.
    pub fn flush(&self, name: &str) -> Result<FlushResult> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.require(name, TableState::Online)?.id;
        catalog.flush_table(id)
    }

    /// Major-compact all files through the MAJC pipeline.
    pub fn compact(&self, name: &str) -> Result<FlushResult> {
        let mut catalog = self.lock_write();
        let id = catalog.lifecycle.require(name, TableState::Online)?.id;
        let majc = catalog.stages(id, IteratorScope::Majc)?;
        Ok(catalog.data_mut(id)?.compact(id, &majc))
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use std::time::Instant;
    use tempfile::tempdir;

    fn manager() -> TableManager {
        TableManager::new()
    }

    fn wait_for_state(manager: &TableManager, name: &str, state: TableState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.table_state(name).unwrap() != state {
            assert!(Instant::now() < deadline, "table '{}' never reached {}", name, state);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn offline(manager: &TableManager, name: &str) {
        manager.set_offline(name).unwrap();
        wait_for_state(manager, name, TableState::Offline);
    }

    fn values(cells: &[Cell]) -> Vec<&str> {
        cells.iter().map(|c| c.value.as_str()).collect()
    }

    // ============================================================================
    // Table Creation
    // ============================================================================

    #[test]
    fn test_create_table() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        assert!(manager.exists("t"));
        assert_eq!(manager.table_state("t").unwrap(), TableState::Online);
        assert_eq!(manager.list_tables(), BTreeSet::from(["t".to_string()]));
        assert_eq!(manager.table_info("t").unwrap().namespace, None);
    }

    #[test]
    fn test_create_namespaced_table() {
        let manager = manager();
        manager.create_table("risk.trades", &CreateOptions::default(), "root").unwrap();
        assert_eq!(manager.table_info("risk.trades").unwrap().namespace.as_deref(), Some("risk"));
    }

    #[test]
    fn test_create_table_already_exists() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        let err = manager.create_table("t", &CreateOptions::default(), "root").unwrap_err();
        assert!(matches!(err, AdminError::TableExists(_)));
    }

    #[test]
    fn test_create_table_invalid_name() {
        let manager = manager();
        let err = manager.create_table("", &CreateOptions::default(), "root").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(manager.create_table("a b", &CreateOptions::default(), "root").is_err());
    }

    #[test]
    fn test_create_with_versioning_registers_default_stage() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        for scope in IteratorScope::ALL {
            assert_eq!(
                manager.list_iterators("t", scope).unwrap(),
                vec![IteratorSetting::versioning(1)]
            );
        }
    }

    #[test]
    fn test_create_without_versioning_has_no_stages() {
        let manager = manager();
        let options = CreateOptions {
            versioning: false,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();
        assert!(manager.get_properties("t").unwrap().is_empty());
    }

    #[test]
    fn test_create_with_bad_initial_property_releases_name() {
        let manager = manager();
        let options = CreateOptions {
            properties: PropertyMap::from([("".to_string(), "x".to_string())]),
            ..CreateOptions::default()
        };
        assert!(manager.create_table("t", &options, "root").is_err());
        assert!(!manager.exists("t"));
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
    }

    #[test]
    fn test_concurrent_create_exactly_one_wins() {
        let manager = Arc::new(manager());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    manager.create_table("race", &CreateOptions::default(), &format!("user{}", i))
                })
            })
            .collect();

        let results: Vec<Result<()>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.into_iter().filter_map(|r| r.err()) {
            assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        }
    }

    // ============================================================================
    // Delete / Rename
    // ============================================================================

    #[test]
    fn test_delete_table() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        manager.delete_table("t").unwrap();

        assert!(!manager.exists("t"));
        assert!(manager.get_properties("t").unwrap_err().is_not_found());
        assert!(manager.delete_table("t").unwrap_err().is_not_found());
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        assert_eq!(manager.list_iterators("t", IteratorScope::Scan).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_offline_table() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        offline(&manager, "t");
        manager.delete_table("t").unwrap();
        assert!(!manager.exists("t"));
    }

    #[test]
    fn test_rename_table() {
        let manager = manager();
        manager.create_table("a", &CreateOptions::default(), "root").unwrap();
        manager.set_property("a", "custom", "1").unwrap();
        manager.create_table("b", &CreateOptions::default(), "root").unwrap();

        assert_eq!(manager.rename_table("a", "b").unwrap_err().kind(), ErrorKind::AlreadyExists);
        assert!(manager.rename_table("missing", "c").unwrap_err().is_not_found());

        manager.rename_table("a", "c").unwrap();
        assert!(!manager.exists("a"));
        assert_eq!(manager.get_properties("c").unwrap().get("custom"), Some(&"1".to_string()));
    }

    // ============================================================================
    // Online / Offline
    // ============================================================================

    #[test]
    fn test_offline_then_online() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        offline(&manager, "t");
        assert!(manager.exists("t"));
        let err = manager.write("t", &[Mutation::new("r", "c", "v")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        manager.set_online("t").unwrap();
        wait_for_state(&manager, "t", TableState::Online);
        manager.write("t", &[Mutation::new("r", "c", "v")]).unwrap();
    }

    #[test]
    fn test_transition_is_asynchronous() {
        let manager = TableManager::with_options(Arc::new(SystemClock), Duration::from_millis(200));
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        manager.set_offline("t").unwrap();
        let info = manager.table_info("t").unwrap();
        assert_eq!(info.state, TableState::Online);
        assert_eq!(info.goal, Some(TableState::Offline));

        wait_for_state(&manager, "t", TableState::Offline);
        assert_eq!(manager.table_info("t").unwrap().goal, None);
    }

    #[test]
    fn test_going_offline_flushes_memtable() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        manager.write("t", &[Mutation::new("r", "c", "v")]).unwrap();

        offline(&manager, "t");
        assert_eq!(manager.table_info("t").unwrap().file_count, 1);
    }

    #[test]
    fn test_transition_of_deleted_table_is_dropped() {
        let manager = TableManager::with_options(Arc::new(SystemClock), Duration::from_millis(50));
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        manager.set_offline("t").unwrap();
        manager.delete_table("t").unwrap();

        thread::sleep(Duration::from_millis(120));
        assert!(!manager.exists("t"));
    }

    // ============================================================================
    // Versioning & timestamps
    // ============================================================================

    #[test]
    fn test_default_versioning_scan_returns_latest() {
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        manager.write("t", &[Mutation::new("r", "c", "A")]).unwrap();
        manager.write("t", &[Mutation::new("r", "c", "B")]).unwrap();

        assert_eq!(values(&manager.scan("t").unwrap()), vec!["B"]);
    }

    #[test]
    fn test_max_versions_retained_across_flush_and_compaction() {
        let manager = manager();
        let options = CreateOptions {
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();
        manager.set_max_versions("t", 3).unwrap();

        for v in ["v1", "v2", "v3", "v4"] {
            manager.write("t", &[Mutation::new("r", "c", v)]).unwrap();
        }
        assert_eq!(values(&manager.scan("t").unwrap()), vec!["v4", "v3", "v2"]);

        manager.flush("t").unwrap();
        manager.write("t", &[Mutation::new("r", "c", "v5")]).unwrap();
        manager.flush("t").unwrap();
        manager.compact("t").unwrap();
        assert_eq!(values(&manager.scan("t").unwrap()), vec!["v5", "v4", "v3"]);

        assert!(manager.set_max_versions("t", 0).is_err());
    }

    #[test]
    fn test_logical_timestamps_ignore_wall_clock() {
        let clock = Arc::new(ManualClock::new(10_000));
        let manager = TableManager::with_options(clock.clone(), Duration::ZERO);
        let options = CreateOptions {
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();

        let first = manager.write("t", &[Mutation::new("r", "c", "a")]).unwrap()[0];
        clock.set(5);
        let second = manager.write("t", &[Mutation::new("r", "c", "b")]).unwrap()[0];
        assert!(second > first);
    }

    #[test]
    fn test_exhausted_logical_counter_rejects_whole_write() {
        let manager = manager();
        let options = CreateOptions {
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();
        manager.lock_write().lifecycle.resolve_mut("t").unwrap().time =
            TableTime::restore(TimestampPolicy::Logical, u64::MAX - 1);

        let batch = [Mutation::new("r", "c", "a"), Mutation::new("r", "c", "b")];
        let err = manager.write("t", &batch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(manager.scan("t").unwrap().is_empty());
        assert_eq!(manager.table_info("t").unwrap().logical_time, u64::MAX - 1);

        assert_eq!(manager.write("t", &batch[..1]).unwrap(), vec![u64::MAX]);
    }

    #[test]
    fn test_set_max_versions_overrides_custom_vers_stage() {
        let manager = manager();
        let options = CreateOptions {
            versioning: false,
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();
        manager
            .attach_iterator(
                "t",
                &IteratorSetting::new(20, "vers", "engine.Custom"),
                &IteratorScope::all(),
            )
            .unwrap();

        manager.set_max_versions("t", 1).unwrap();
        manager.write("t", &[Mutation::new("k", "cf", "A")]).unwrap();
        manager.write("t", &[Mutation::new("k", "cf", "B")]).unwrap();
        assert_eq!(values(&manager.scan("t").unwrap()), vec!["B"]);
    }

    #[test]
    fn test_wall_clock_timestamps_follow_clock() {
        let clock = Arc::new(ManualClock::new(10_000));
        let manager = TableManager::with_options(clock.clone(), Duration::ZERO);
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        let ts = manager.write("t", &[Mutation::new("r", "c", "a")]).unwrap();
        assert_eq!(ts, vec![10_000]);
        assert_eq!(manager.table_info("t").unwrap().created_at_ms, 10_000);
    }

    // ============================================================================
    // Clone
    // ============================================================================

    #[test]
    fn test_clone_properties_and_access() {
        let manager = manager();
        manager.create_table("src", &CreateOptions::default(), "alice").unwrap();
        manager.grant_access("src", "bob").unwrap();
        manager.set_property("src", "keep", "1").unwrap();
        manager.set_property("src", "drop", "2").unwrap();
        manager.set_property("src", "over", "3").unwrap();

        let options = CloneOptions {
            flush: false,
            set_properties: PropertyMap::from([("over".to_string(), "30".to_string())]),
            exclude_properties: BTreeSet::from(["drop".to_string()]),
        };
        manager.clone_table("src", "dst", &options, "carol").unwrap();

        let props = manager.get_properties("dst").unwrap();
        assert_eq!(props.get("keep"), Some(&"1".to_string()));
        assert_eq!(props.get("drop"), None);
        assert_eq!(props.get("over"), Some(&"30".to_string()));
        assert_eq!(
            manager.list_iterators("dst", IteratorScope::Scan).unwrap(),
            vec![IteratorSetting::versioning(1)]
        );
        assert_eq!(
            manager.table_info("dst").unwrap().principals,
            BTreeSet::from(["carol".to_string()])
        );
    }

    #[test]
    fn test_clone_is_independent() {
        let manager = manager();
        manager.create_table("src", &CreateOptions::default(), "root").unwrap();
        manager.clone_table("src", "dst", &CloneOptions::default(), "root").unwrap();

        manager.set_property("src", "after", "1").unwrap();
        manager.set_max_versions("dst", 4).unwrap();

        assert!(manager.get_properties("dst").unwrap().get("after").is_none());
        assert_eq!(
            manager.list_iterators("src", IteratorScope::Scan).unwrap(),
            vec![IteratorSetting::versioning(1)]
        );
    }

    #[test]
    fn test_clone_without_flush_excludes_memtable() {
        let manager = manager();
        manager.create_table("src", &CreateOptions::default(), "root").unwrap();
        manager.write("src", &[Mutation::new("a", "c", "flushed")]).unwrap();
        manager.flush("src").unwrap();
        manager.write("src", &[Mutation::new("b", "c", "pending")]).unwrap();

        manager.clone_table("src", "noflush", &CloneOptions::default(), "root").unwrap();
        let with_flush = CloneOptions {
            flush: true,
            ..CloneOptions::default()
        };
        manager.clone_table("src", "flushed", &with_flush, "root").unwrap();

        assert_eq!(values(&manager.scan("noflush").unwrap()), vec!["flushed"]);
        assert_eq!(values(&manager.scan("flushed").unwrap()), vec!["flushed", "pending"]);
    }

    #[test]
    fn test_clone_errors() {
        let manager = manager();
        manager.create_table("src", &CreateOptions::default(), "root").unwrap();
        manager.create_table("dst", &CreateOptions::default(), "root").unwrap();

        let err = manager
            .clone_table("missing", "new", &CloneOptions::default(), "root")
            .unwrap_err();
        assert!(err.is_not_found());
        let err = manager
            .clone_table("src", "dst", &CloneOptions::default(), "root")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_clone_of_offline_source() {
        let manager = manager();
        manager.create_table("src", &CreateOptions::default(), "root").unwrap();
        offline(&manager, "src");

        let options = CloneOptions {
            flush: true,
            ..CloneOptions::default()
        };
        manager.clone_table("src", "dst", &options, "root").unwrap();
        assert_eq!(manager.table_state("dst").unwrap(), TableState::Online);
        assert_eq!(manager.table_state("src").unwrap(), TableState::Offline);
    }

    #[test]
    fn test_clone_carries_logical_time() {
        let manager = manager();
        let options = CreateOptions {
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("src", &options, "root").unwrap();
        let last = *manager
            .write("src", &[Mutation::new("r", "c", "a"), Mutation::new("r", "c", "b")])
            .unwrap()
            .last()
            .unwrap();

        manager.clone_table("src", "dst", &CloneOptions::default(), "root").unwrap();
        let next = manager.write("dst", &[Mutation::new("r", "c", "x")]).unwrap()[0];
        assert!(next > last);
    }

    // ============================================================================
    // Export / Import
    // ============================================================================

    #[test]
    fn test_export_requires_offline() {
        let dir = tempdir().unwrap();
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();

        let err = manager.export_table("t", dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = manager();
        let options = CreateOptions {
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();
        manager.set_property("t", "table.custom", "x").unwrap();
        manager
            .attach_iterator(
                "t",
                &IteratorSetting::new(30, "ageoff", "engine.AgeOff").with_option("ttl", "60"),
                &BTreeSet::from([IteratorScope::Scan, IteratorScope::Majc]),
            )
            .unwrap();
        manager
            .add_splits("t", &BTreeSet::from(["g".to_string(), "p".to_string()]))
            .unwrap();
        manager.write("t", &[Mutation::new("r", "c", "v")]).unwrap();
        offline(&manager, "t");

        let manifest = manager.export_table("t", dir.path()).unwrap();
        assert_eq!(manifest.files.len(), 1);

        manager.import_table("t2", dir.path(), "root").unwrap();

        assert_eq!(manager.get_properties("t2").unwrap(), manager.get_properties("t").unwrap());
        for scope in IteratorScope::ALL {
            assert_eq!(
                manager.list_iterators("t2", scope).unwrap(),
                manager.list_iterators("t", scope).unwrap()
            );
        }
        assert_eq!(manager.list_splits("t2").unwrap(), manager.list_splits("t").unwrap());
        let info = manager.table_info("t2").unwrap();
        assert_eq!(info.timestamp_policy, TimestampPolicy::Logical);
        assert_eq!(info.logical_time, manager.table_info("t").unwrap().logical_time);
        assert_eq!(info.state, TableState::Online);
    }

    #[test]
    fn test_import_exhausted_logical_time_rejected() {
        let dir = tempdir().unwrap();
        let manager = manager();
        let options = CreateOptions {
            timestamp_policy: TimestampPolicy::Logical,
            ..CreateOptions::default()
        };
        manager.create_table("t", &options, "root").unwrap();
        offline(&manager, "t");
        let mut manifest = manager.export_table("t", dir.path()).unwrap();
        manifest.logical_time = u64::MAX;
        manifest.write_to(dir.path()).unwrap();

        let err = manager.import_table("t2", dir.path(), "root").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!manager.exists("t2"));
    }

    #[test]
    fn test_import_existing_name_fails() {
        let dir = tempdir().unwrap();
        let manager = manager();
        manager.create_table("t", &CreateOptions::default(), "root").unwrap();
        offline(&manager, "t");
        manager.export_table("t", dir.path()).unwrap();

        let err = manager.import_table("t", dir.path(), "root").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    // ============================================================================
    // Disk usage
    // ============================================================================

    #[test]
    fn test_disk_usage_disjoint_tables() {
        let manager = manager();
        for name in ["t1", "t2"] {
            manager.create_table(name, &CreateOptions::default(), "root").unwrap();
        }
        manager.write("t1", &[Mutation::new("row", "c", "value")]).unwrap();
        manager.flush("t1").unwrap();
        manager.write("t2", &[Mutation::new("r", "c", "v")]).unwrap();
        manager.flush("t2").unwrap();

        let usage = manager
            .disk_usage(&BTreeSet::from(["t1".to_string(), "t2".to_string()]))
            .unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].tables, BTreeSet::from(["t1".to_string()]));
        assert_eq!(usage[1].tables, BTreeSet::from(["t2".to_string()]));
        assert_ne!(usage[0].usage_bytes, usage[1].usage_bytes);
    }

    #[test]
    fn test_disk_usage_groups_clones() {
        let manager = manager();
        manager.create_table("src", &CreateOptions::default(), "root").unwrap();
        manager.write("src", &[Mutation::new("r", "c", "v")]).unwrap();
        manager.flush("src").unwrap();
        manager.clone_table("src", "copy", &CloneOptions::default(), "root").unwrap();
        manager.create_table("other", &CreateOptions::default(), "root").unwrap();

        let names = BTreeSet::from(["src".to_string(), "copy".to_string(), "other".to_string()]);
        let usage = manager.disk_usage(&names).unwrap();
        assert_eq!(usage.len(), 2);

        let shared = usage.iter().find(|u| u.tables.len() == 2).unwrap();
        assert!(shared.tables.contains("src") && shared.tables.contains("copy"));
        assert_eq!(shared.usage_bytes, 1 + 1 + 1 + 8);
        let lone = usage.iter().find(|u| u.tables.len() == 1).unwrap();
        assert_eq!(lone.usage_bytes, 0);
    }

    #[test]
    fn test_disk_usage_unknown_table() {
        let manager = manager();
        let err = manager.disk_usage(&BTreeSet::from(["nope".to_string()])).unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.disk_usage(&BTreeSet::new()).unwrap().is_empty());
    }
}
