//! Wire protocol of the admin server
//!
//! Frames:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! Requests are maps tagged by `cmd`; responses are maps tagged by `kind`.
//! Either may carry a `requestId`, which the server echoes back. Failures
//! are `{kind: "error", code, message}` with `code` one of the `ErrorKind`
//! codes.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::catalog::{CloneOptions, CreateOptions, DiskUsage, Mutation, TableInfo};
use crate::error::{AdminError, Result};
use crate::iterators::{IteratorScope, IteratorSetting};
use crate::lifecycle::TableState;
use crate::properties::PropertyMap;
use crate::tablet::Cell;

// ============================================================================
// Requests
// ============================================================================

/// Request from client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    /// Announce protocol version and principal
    Hello {
        #[serde(rename = "protocolVersion")]
        protocol_version: Option<u32>,
        principal: Option<String>,
    },
    Ping,

    // ========================================================================
    // Lifecycle
    // ========================================================================

    CreateTable {
        name: String,
        #[serde(default)]
        options: CreateOptions,
    },
    CloneTable {
        source: String,
        target: String,
        #[serde(default)]
        options: CloneOptions,
    },
    DeleteTable { name: String },
    RenameTable {
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },
    SetOnline { name: String },
    SetOffline { name: String },
    TableState { name: String },
    TableInfo { name: String },
    TableExists { name: String },
    ListTables,
    GrantAccess { name: String, principal: String },

    // ========================================================================
    // Export / Import / Usage
    // ========================================================================

    ExportTable { name: String, dir: String },
    ImportTable { name: String, dir: String },
    DiskUsage { tables: BTreeSet<String> },

    // ========================================================================
    // Properties and iterators
    // ========================================================================

    GetProperties { name: String },
    SetProperty { name: String, key: String, value: String },
    RemoveProperty { name: String, key: String },
    AttachIterator {
        name: String,
        setting: IteratorSetting,
        scopes: BTreeSet<IteratorScope>,
    },
    RemoveIterator {
        name: String,
        stage: String,
        scope: IteratorScope,
    },
    ListIterators { name: String, scope: IteratorScope },
    SetMaxVersions {
        name: String,
        #[serde(rename = "maxVersions")]
        max_versions: u32,
    },

    // ========================================================================
    // Splits and data
    // ========================================================================

    AddSplits { name: String, splits: BTreeSet<String> },
    ListSplits { name: String },
    Write { name: String, mutations: Vec<Mutation> },
    Scan { name: String },
    Flush { name: String },
    Compact { name: String },
}

impl Request {
    /// Operation name used in logs.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "Hello",
            Request::Ping => "Ping",
            Request::CreateTable { .. } => "CreateTable",
            Request::CloneTable { .. } => "CloneTable",
            Request::DeleteTable { .. } => "DeleteTable",
            Request::RenameTable { .. } => "RenameTable",
            Request::SetOnline { .. } => "SetOnline",
            Request::SetOffline { .. } => "SetOffline",
            Request::TableState { .. } => "TableState",
            Request::TableInfo { .. } => "TableInfo",
            Request::TableExists { .. } => "TableExists",
            Request::ListTables => "ListTables",
            Request::GrantAccess { .. } => "GrantAccess",
            Request::ExportTable { .. } => "ExportTable",
            Request::ImportTable { .. } => "ImportTable",
            Request::DiskUsage { .. } => "DiskUsage",
            Request::GetProperties { .. } => "GetProperties",
            Request::SetProperty { .. } => "SetProperty",
            Request::RemoveProperty { .. } => "RemoveProperty",
            Request::AttachIterator { .. } => "AttachIterator",
            Request::RemoveIterator { .. } => "RemoveIterator",
            Request::ListIterators { .. } => "ListIterators",
            Request::SetMaxVersions { .. } => "SetMaxVersions",
            Request::AddSplits { .. } => "AddSplits",
            Request::ListSplits { .. } => "ListSplits",
            Request::Write { .. } => "Write",
            Request::Scan { .. } => "Scan",
            Request::Flush { .. } => "Flush",
            Request::Compact { .. } => "Compact",
        }
    }

    /// Requests without side effects; safe to resend after a dropped
    /// connection.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Request::Ping
                | Request::TableState { .. }
                | Request::TableInfo { .. }
                | Request::TableExists { .. }
                | Request::ListTables
                | Request::DiskUsage { .. }
                | Request::GetProperties { .. }
                | Request::ListIterators { .. }
                | Request::ListSplits { .. }
                | Request::Scan { .. }
        )
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Response to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Response {
    HelloOk {
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "serverVersion")]
        server_version: String,
        principal: String,
    },
    Pong,
    Ok,
    Exists { exists: bool },
    Tables { tables: BTreeSet<String> },
    State { state: TableState },
    Info { info: TableInfo },
    Exported {
        #[serde(rename = "manifestPath")]
        manifest_path: String,
        files: Vec<String>,
    },
    DiskUsage { usage: Vec<DiskUsage> },
    Properties { properties: PropertyMap },
    Iterators { iterators: Vec<IteratorSetting> },
    Splits { splits: BTreeSet<String> },
    Added { count: usize },
    Written { timestamps: Vec<u64> },
    Cells { cells: Vec<Cell> },
    Flushed {
        #[serde(rename = "fileId")]
        file_id: Option<String>,
        #[serde(rename = "cellsWritten")]
        cells_written: usize,
    },
    Error { code: String, message: String },
}

impl Response {
    pub fn error(err: &AdminError) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Turn an `Error` response back into an `AdminError`.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { code, message } => Err(AdminError::from_wire(&code, message)),
            other => Ok(other),
        }
    }
}

/// Request envelope: captures requestId alongside the tagged Request.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

/// Response envelope: wraps Response with optional requestId for echo-back.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub response: Response,
}

// ============================================================================
// Framing
// ============================================================================

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub fn read_message<R: Read>(stream: &mut R, max_frame_bytes: usize) -> io::Result<Option<Vec<u8>>> {
    // Read 4-byte length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (limit {})", len, max_frame_bytes),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_message<W: Write>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "Message exceeds 4 GiB frame limit")
    })?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

/// Serialize a message as a MessagePack map (named fields).
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(message)
        .map_err(|e| AdminError::Transport(format!("Failed to encode message: {}", e)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| AdminError::Transport(format!("Failed to decode message: {}", e)))
}
