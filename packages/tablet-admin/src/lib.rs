//! tablet-admin - administrative control plane for a tablet store
//!
//! The service side (`catalog::TableManager`) owns table lifecycle state,
//! per-table properties, iterator pipelines and cell storage. The client
//! side (`operations::TableOperations`) validates arguments and forwards
//! each administrative call over an `AdminRpc` handle, either in-process
//! (`client::LocalClient`) or over a Unix socket (`client::SocketClient`).

pub mod catalog;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod iterators;
pub mod lifecycle;
pub mod manifest;
pub mod names;
pub mod operations;
pub mod properties;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tablet;

pub use catalog::{CloneOptions, CreateOptions, DiskUsage, Mutation, TableInfo, TableManager};
pub use client::{AdminRpc, LocalClient, SocketClient};
pub use clock::{Clock, ManualClock, SystemClock, TimestampPolicy};
pub use config::{ClientConfig, ServerConfig};
pub use error::{AdminError, ErrorKind, Result};
pub use iterators::{IteratorScope, IteratorSetting};
pub use lifecycle::TableState;
pub use operations::TableOperations;
pub use properties::PropertyMap;
pub use tablet::Cell;
