//! TableOperations - client-side administrative control plane
//!
//! Every method validates its arguments locally, forwards one request over
//! the `AdminRpc` handle and unpacks the reply. The service re-validates
//! everything; nothing here is cached between calls.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tablet_admin::catalog::TableManager;
//! use tablet_admin::client::LocalClient;
//! use tablet_admin::operations::TableOperations;
//!
//! let ops = TableOperations::new(LocalClient::new(Arc::new(TableManager::new())));
//! ops.create("trades").unwrap();
//! ops.offline("trades", true).unwrap();
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Instant;

use crate::catalog::{CloneOptions, CreateOptions, DiskUsage, Mutation, TableInfo};
use crate::client::AdminRpc;
use crate::clock::TimestampPolicy;
use crate::config::ClientConfig;
use crate::error::{AdminError, Result};
use crate::iterators::{IteratorScope, IteratorSetting};
use crate::lifecycle::TableState;
use crate::names::validate_table_name;
use crate::properties::{validate_property, PropertyMap};
use crate::protocol::{Request, Response};
use crate::tablet::{Cell, FlushResult};

fn unexpected(op: &str, response: Response) -> AdminError {
    AdminError::Transport(format!("Unexpected response to {}: {:?}", op, response))
}

pub struct TableOperations<R: AdminRpc> {
    rpc: R,
    config: ClientConfig,
}

impl<R: AdminRpc> TableOperations<R> {
    pub fn new(rpc: R) -> Self {
        Self::with_config(rpc, ClientConfig::default())
    }

    pub fn with_config(rpc: R, config: ClientConfig) -> Self {
        Self { rpc, config }
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    /// Send a request; service errors come back as `Err`.
    fn call(&self, request: Request) -> Result<Response> {
        self.rpc.call(request)?.into_result()
    }

    fn call_ok(&self, request: Request) -> Result<()> {
        let op = request.operation_name();
        match self.call(request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(op, other)),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a table with the default versioning stage and wall-clock
    /// timestamps.
    pub fn create(&self, name: &str) -> Result<()> {
        self.create_with(name, &CreateOptions::default())
    }

    pub fn create_with(&self, name: &str, options: &CreateOptions) -> Result<()> {
        validate_table_name(name)?;
        for (key, value) in &options.properties {
            validate_property(key, value)?;
        }
        self.call_ok(Request::CreateTable {
            name: name.to_string(),
            options: options.clone(),
        })
    }

    /// Create a table with logical timestamps (`true`) or wall-clock ones.
    pub fn create_versioned(&self, name: &str, versioning: bool, logical_timestamps: bool) -> Result<()> {
        let options = CreateOptions {
            versioning,
            timestamp_policy: if logical_timestamps {
                TimestampPolicy::Logical
            } else {
                TimestampPolicy::WallClock
            },
            properties: PropertyMap::new(),
        };
        self.create_with(name, &options)
    }

    /// Clone `source` into `target`. Without `flush`, data still in the
    /// source's memtable is not part of the clone.
    pub fn clone_table(
        &self,
        source: &str,
        target: &str,
        flush: bool,
        set_properties: PropertyMap,
        exclude_properties: BTreeSet<String>,
    ) -> Result<()> {
        validate_table_name(source)?;
        validate_table_name(target)?;
        for (key, value) in &set_properties {
            validate_property(key, value)?;
        }
        self.call_ok(Request::CloneTable {
            source: source.to_string(),
            target: target.to_string(),
            options: CloneOptions {
                flush,
                set_properties,
                exclude_properties,
            },
        })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        validate_table_name(name)?;
        self.call_ok(Request::DeleteTable { name: name.to_string() })
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        validate_table_name(old_name)?;
        validate_table_name(new_name)?;
        self.call_ok(Request::RenameTable {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        })
    }

    /// Bring a table online. With `wait`, block until the service reports it
    /// online; otherwise return once the request is accepted.
    pub fn online(&self, name: &str, wait: bool) -> Result<()> {
        validate_table_name(name)?;
        self.call_ok(Request::SetOnline { name: name.to_string() })?;
        if wait {
            self.wait_for_state(name, TableState::Online)?;
        }
        Ok(())
    }

    /// Take a table offline. With `wait`, block until the service reports it
    /// offline.
    pub fn offline(&self, name: &str, wait: bool) -> Result<()> {
        validate_table_name(name)?;
        self.call_ok(Request::SetOffline { name: name.to_string() })?;
        if wait {
            self.wait_for_state(name, TableState::Offline)?;
        }
        Ok(())
    }

    fn wait_for_state(&self, name: &str, target: TableState) -> Result<()> {
        let deadline = Instant::now() + self.config.wait_timeout();
        loop {
            if self.table_state(name)? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AdminError::Transport(format!(
                    "Timed out waiting for table '{}' to become {}",
                    name, target
                )));
            }
            thread::sleep(self.config.poll_interval());
        }
    }

    pub fn table_state(&self, name: &str) -> Result<TableState> {
        validate_table_name(name)?;
        match self.call(Request::TableState { name: name.to_string() })? {
            Response::State { state } => Ok(state),
            other => Err(unexpected("TableState", other)),
        }
    }

    pub fn table_info(&self, name: &str) -> Result<TableInfo> {
        validate_table_name(name)?;
        match self.call(Request::TableInfo { name: name.to_string() })? {
            Response::Info { info } => Ok(info),
            other => Err(unexpected("TableInfo", other)),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        validate_table_name(name)?;
        match self.call(Request::TableExists { name: name.to_string() })? {
            Response::Exists { exists } => Ok(exists),
            other => Err(unexpected("TableExists", other)),
        }
    }

    pub fn list_tables(&self) -> Result<BTreeSet<String>> {
        match self.call(Request::ListTables)? {
            Response::Tables { tables } => Ok(tables),
            other => Err(unexpected("ListTables", other)),
        }
    }

    pub fn grant_access(&self, name: &str, principal: &str) -> Result<()> {
        validate_table_name(name)?;
        if principal.is_empty() {
            return Err(AdminError::invalid("Principal must not be empty"));
        }
        self.call_ok(Request::GrantAccess {
            name: name.to_string(),
            principal: principal.to_string(),
        })
    }

    // ========================================================================
    // Export / Import / Usage
    // ========================================================================

    /// Export an offline table into `dir`. Returns the data file ids the
    /// caller must copy while the table stays offline.
    pub fn export(&self, name: &str, dir: &Path) -> Result<Vec<String>> {
        validate_table_name(name)?;
        let request = Request::ExportTable {
            name: name.to_string(),
            dir: dir.display().to_string(),
        };
        match self.call(request)? {
            Response::Exported { files, .. } => Ok(files),
            other => Err(unexpected("ExportTable", other)),
        }
    }

    pub fn import(&self, name: &str, dir: &Path) -> Result<()> {
        validate_table_name(name)?;
        self.call_ok(Request::ImportTable {
            name: name.to_string(),
            dir: dir.display().to_string(),
        })
    }

    pub fn disk_usage(&self, names: &BTreeSet<String>) -> Result<Vec<DiskUsage>> {
        for name in names {
            validate_table_name(name)?;
        }
        match self.call(Request::DiskUsage { tables: names.clone() })? {
            Response::DiskUsage { usage } => Ok(usage),
            other => Err(unexpected("DiskUsage", other)),
        }
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub fn get_properties(&self, name: &str) -> Result<PropertyMap> {
        validate_table_name(name)?;
        match self.call(Request::GetProperties { name: name.to_string() })? {
            Response::Properties { properties } => Ok(properties),
            other => Err(unexpected("GetProperties", other)),
        }
    }

    pub fn set_property(&self, name: &str, key: &str, value: &str) -> Result<()> {
        validate_table_name(name)?;
        validate_property(key, value)?;
        self.call_ok(Request::SetProperty {
            name: name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn remove_property(&self, name: &str, key: &str) -> Result<()> {
        validate_table_name(name)?;
        if key.is_empty() {
            return Err(AdminError::invalid("Property key must not be empty"));
        }
        self.call_ok(Request::RemoveProperty {
            name: name.to_string(),
            key: key.to_string(),
        })
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
        validate_table_name(name)?;
        setting.validate()?;
        if scopes.is_empty() {
            return Err(AdminError::invalid("Iterator must be attached to at least one scope"));
        }
        self.call_ok(Request::AttachIterator {
            name: name.to_string(),
            setting: setting.clone(),
            scopes: scopes.clone(),
        })
    }

    pub fn remove_iterator(&self, name: &str, stage: &str, scope: IteratorScope) -> Result<()> {
        validate_table_name(name)?;
        crate::names::validate_stage_name(stage)?;
        self.call_ok(Request::RemoveIterator {
            name: name.to_string(),
            stage: stage.to_string(),
            scope,
        })
    }

    pub fn list_iterators(&self, name: &str, scope: IteratorScope) -> Result<Vec<IteratorSetting>> {
        validate_table_name(name)?;
        match self.call(Request::ListIterators { name: name.to_string(), scope })? {
            Response::Iterators { iterators } => Ok(iterators),
            other => Err(unexpected("ListIterators", other)),
        }
    }

    /// Retain at most `max_versions` versions of every cell in all scopes.
    pub fn set_max_versions(&self, name: &str, max_versions: u32) -> Result<()> {
        validate_table_name(name)?;
        if max_versions == 0 {
            return Err(AdminError::invalid("maxVersions must be at least 1"));
        }
        self.call_ok(Request::SetMaxVersions {
            name: name.to_string(),
            max_versions,
        })
    }

    // ========================================================================
    // Splits and data
    // ========================================================================

    /// Add split points; returns how many were new.
    pub fn add_splits(&self, name: &str, splits: &BTreeSet<String>) -> Result<usize> {
        validate_table_name(name)?;
        match self.call(Request::AddSplits {
            name: name.to_string(),
            splits: splits.clone(),
        })? {
            Response::Added { count } => Ok(count),
            other => Err(unexpected("AddSplits", other)),
        }
    }

    pub fn list_splits(&self, name: &str) -> Result<BTreeSet<String>> {
        validate_table_name(name)?;
        match self.call(Request::ListSplits { name: name.to_string() })? {
            Response::Splits { splits } => Ok(splits),
            other => Err(unexpected("ListSplits", other)),
        }
    }

    /// Write mutations; returns the timestamps the service assigned.
    pub fn write(&self, name: &str, mutations: Vec<Mutation>) -> Result<Vec<u64>> {
        validate_table_name(name)?;
        match self.call(Request::Write {
            name: name.to_string(),
            mutations,
        })? {
            Response::Written { timestamps } => Ok(timestamps),
            other => Err(unexpected("Write", other)),
        }
    }

    pub fn scan(&self, name: &str) -> Result<Vec<Cell>> {
        validate_table_name(name)?;
        match self.call(Request::Scan { name: name.to_string() })? {
            Response::Cells { cells } => Ok(cells),
            other => Err(unexpected("Scan", other)),
        }
    }

    pub fn flush(&self, name: &str) -> Result<FlushResult> {
        validate_table_name(name)?;
        self.compaction(Request::Flush { name: name.to_string() })
    }

    pub fn compact(&self, name: &str) -> Result<FlushResult> {
        validate_table_name(name)?;
        self.compaction(Request::Compact { name: name.to_string() })
    }

    fn compaction(&self, request: Request) -> Result<FlushResult> {
        let op = request.operation_name();
        match self.call(request)? {
            Response::Flushed { file_id, cells_written } => Ok(FlushResult { file_id, cells_written }),
            other => Err(unexpected(op, other)),
        }
    }
}

#[cfg(test)]
mod operations_tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Mutex;

    /// Records requests and answers every one with a fixed response.
    struct Recorder {
        sent: Mutex<Vec<Request>>,
        reply: Response,
    }

    impl Recorder {
        fn replying(reply: Response) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                reply,
            }
        }

        fn sent(&self) -> Vec<Request> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl AdminRpc for Recorder {
        fn call(&self, request: Request) -> Result<Response> {
            self.sent.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_invalid_arguments_never_reach_the_service() {
        let ops = TableOperations::new(Recorder::replying(Response::Ok));

        assert_eq!(ops.create("").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(ops.set_max_versions("t", 0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(ops.set_property("t", "", "v").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            ops.attach_iterator("t", &IteratorSetting::new(5, "x", "c"), &BTreeSet::new())
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert!(ops.rpc().sent().is_empty());
    }

    #[test]
    fn test_service_error_surfaces_with_kind() {
        let ops = TableOperations::new(Recorder::replying(Response::Error {
            code: "ALREADY_EXISTS".into(),
            message: "Table 't' already exists".into(),
        }));
        let err = ops.create("t").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.to_string(), "Table 't' already exists");
    }

    #[test]
    fn test_unexpected_response_is_transport_error() {
        let ops = TableOperations::new(Recorder::replying(Response::Pong));
        assert_eq!(ops.exists("t").unwrap_err().kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_offline_without_wait_sends_single_request() {
        let ops = TableOperations::new(Recorder::replying(Response::Ok));
        ops.offline("t", false).unwrap();
        assert_eq!(ops.rpc().sent(), vec![Request::SetOffline { name: "t".into() }]);
    }

    #[test]
    fn test_wait_times_out_as_transport_error() {
        struct NeverOffline;
        impl AdminRpc for NeverOffline {
            fn call(&self, request: Request) -> Result<Response> {
                Ok(match request {
                    Request::TableState { .. } => Response::State { state: TableState::Online },
                    _ => Response::Ok,
                })
            }
        }

        let config = ClientConfig {
            wait_poll_interval_ms: 1,
            wait_timeout_ms: 20,
        };
        let ops = TableOperations::with_config(NeverOffline, config);
        let err = ops.offline("t", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("Timed out"));
    }

    #[test]
    fn test_create_versioned_maps_to_options() {
        let ops = TableOperations::new(Recorder::replying(Response::Ok));
        ops.create_versioned("t", false, true).unwrap();

        match &ops.rpc().sent()[0] {
            Request::CreateTable { options, .. } => {
                assert!(!options.versioning);
                assert_eq!(options.timestamp_policy, TimestampPolicy::Logical);
            }
            other => panic!("Expected CreateTable, got {:?}", other),
        }
    }
}
