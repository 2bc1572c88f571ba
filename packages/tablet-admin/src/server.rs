//! Request dispatch and the Unix socket accept loop
//!
//! One thread per connection; each connection owns a `ClientSession` and
//! shares the `TableManager`. A malformed frame gets an error response and
//! the connection stays open; an oversized or truncated frame closes it.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::catalog::TableManager;
use crate::error::{AdminError, Result};
use crate::protocol::{
    decode, encode, read_message, write_message, Request, RequestEnvelope, Response,
    ResponseEnvelope,
};
use crate::session::{ClientId, ClientSession, PROTOCOL_VERSION};

// Global client ID counter
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Requests slower than this are logged at warn level.
const SLOW_REQUEST_MS: u128 = 500;

// ============================================================================
// Request Handler
// ============================================================================

/// Execute one request against the manager on behalf of `session`.
pub fn handle_request(manager: &TableManager, session: &mut ClientSession, request: Request) -> Response {
    dispatch(manager, session, request).unwrap_or_else(|e| {
        tracing::debug!("client {} request failed: {}", session.id, e);
        Response::error(&e)
    })
}

fn dispatch(manager: &TableManager, session: &mut ClientSession, request: Request) -> Result<Response> {
    let response = match request {
        Request::Hello { protocol_version, principal } => {
            let version = protocol_version.unwrap_or(PROTOCOL_VERSION);
            if version > PROTOCOL_VERSION {
                return Err(AdminError::invalid(format!(
                    "Unsupported protocol version {} (server speaks {})",
                    version, PROTOCOL_VERSION
                )));
            }
            session.identify(principal, version);
            Response::HelloOk {
                protocol_version: PROTOCOL_VERSION,
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                principal: session.principal().to_string(),
            }
        }
        Request::Ping => Response::Pong,

        // ====================================================================
        // Lifecycle
        // ====================================================================

        Request::CreateTable { name, options } => {
            manager.create_table(&name, &options, session.principal())?;
            Response::Ok
        }
        Request::CloneTable { source, target, options } => {
            manager.clone_table(&source, &target, &options, session.principal())?;
            Response::Ok
        }
        Request::DeleteTable { name } => {
            manager.delete_table(&name)?;
            Response::Ok
        }
        Request::RenameTable { old_name, new_name } => {
            manager.rename_table(&old_name, &new_name)?;
            Response::Ok
        }
        Request::SetOnline { name } => {
            manager.set_online(&name)?;
            Response::Ok
        }
        Request::SetOffline { name } => {
            manager.set_offline(&name)?;
            Response::Ok
        }
        Request::TableState { name } => Response::State {
            state: manager.table_state(&name)?,
        },
        Request::TableInfo { name } => Response::Info {
            info: manager.table_info(&name)?,
        },
        Request::TableExists { name } => Response::Exists {
            exists: manager.exists(&name),
        },
        Request::ListTables => Response::Tables {
            tables: manager.list_tables(),
        },
        Request::GrantAccess { name, principal } => {
            manager.grant_access(&name, &principal)?;
            Response::Ok
        }

        // ====================================================================
        // Export / Import / Usage
        // ====================================================================

        Request::ExportTable { name, dir } => {
            let dir = Path::new(&dir);
            let manifest = manager.export_table(&name, dir)?;
            Response::Exported {
                manifest_path: dir.join(crate::manifest::MANIFEST_FILE).display().to_string(),
                files: manifest.files.into_iter().map(|f| f.id).collect(),
            }
        }
        Request::ImportTable { name, dir } => {
            manager.import_table(&name, Path::new(&dir), session.principal())?;
            Response::Ok
        }
        Request::DiskUsage { tables } => Response::DiskUsage {
            usage: manager.disk_usage(&tables)?,
        },

        // ====================================================================
        // Properties and iterators
        // ====================================================================

        Request::GetProperties { name } => Response::Properties {
            properties: manager.get_properties(&name)?,
        },
        Request::SetProperty { name, key, value } => {
            manager.set_property(&name, &key, &value)?;
            Response::Ok
        }
        Request::RemoveProperty { name, key } => {
            manager.remove_property(&name, &key)?;
            Response::Ok
        }
        Request::AttachIterator { name, setting, scopes } => {
            manager.attach_iterator(&name, &setting, &scopes)?;
            Response::Ok
        }
        Request::RemoveIterator { name, stage, scope } => {
            manager.remove_iterator(&name, &stage, scope)?;
            Response::Ok
        }
        Request::ListIterators { name, scope } => Response::Iterators {
            iterators: manager.list_iterators(&name, scope)?,
        },
        Request::SetMaxVersions { name, max_versions } => {
            manager.set_max_versions(&name, max_versions)?;
            Response::Ok
        }

        // ====================================================================
        // Splits and data
        // ====================================================================

        Request::AddSplits { name, splits } => Response::Added {
            count: manager.add_splits(&name, &splits)?,
        },
        Request::ListSplits { name } => Response::Splits {
            splits: manager.list_splits(&name)?,
        },
        Request::Write { name, mutations } => Response::Written {
            timestamps: manager.write(&name, &mutations)?,
        },
        Request::Scan { name } => Response::Cells {
            cells: manager.scan(&name)?,
        },
        Request::Flush { name } => {
            let result = manager.flush(&name)?;
            Response::Flushed {
                file_id: result.file_id,
                cells_written: result.cells_written,
            }
        }
        Request::Compact { name } => {
            let result = manager.compact(&name)?;
            Response::Flushed {
                file_id: result.file_id,
                cells_written: result.cells_written,
            }
        }
    };
    Ok(response)
}

// ============================================================================
// Client Connection Handler
// ============================================================================

/// Serve one connection until the peer disconnects or the stream fails.
pub fn handle_client<S: Read + Write>(
    mut stream: S,
    manager: &TableManager,
    client_id: ClientId,
    max_frame_bytes: usize,
) {
    tracing::info!("client {} connected", client_id);
    let mut session = ClientSession::new(client_id);

    loop {
        let msg = match read_message(&mut stream, max_frame_bytes) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::info!("client {} disconnected", client_id);
                break;
            }
            Err(e) => {
                tracing::warn!("client {} read error: {}", client_id, e);
                break;
            }
        };

        let envelope = match decode::<RequestEnvelope>(&msg) {
            Ok(envelope) => envelope,
            Err(e) => {
                let response = Response::error(&AdminError::invalid(format!("Invalid request: {}", e)));
                if send(&mut stream, None, response).is_err() {
                    break;
                }
                continue;
            }
        };

        let op_name = envelope.request.operation_name();
        let start = Instant::now();
        let response = handle_request(manager, &mut session, envelope.request);

        let elapsed = start.elapsed().as_millis();
        if elapsed >= SLOW_REQUEST_MS {
            tracing::warn!("slow request {}: {}ms (client {})", op_name, elapsed, client_id);
        } else {
            tracing::debug!("{} took {}ms (client {})", op_name, elapsed, client_id);
        }

        if let Err(e) = send(&mut stream, envelope.request_id, response) {
            tracing::warn!("client {} write error: {}", client_id, e);
            break;
        }
    }
}

fn send<W: Write>(stream: &mut W, request_id: Option<String>, response: Response) -> Result<()> {
    let bytes = encode(&ResponseEnvelope { request_id, response })?;
    write_message(stream, &bytes)?;
    Ok(())
}

/// Accept connections forever, one thread per client.
pub fn serve(listener: UnixListener, manager: Arc<TableManager>, max_frame_bytes: usize) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => spawn_client(stream, Arc::clone(&manager), max_frame_bytes),
            Err(e) => tracing::warn!("accept error: {}", e),
        }
    }
}

fn spawn_client(stream: UnixStream, manager: Arc<TableManager>, max_frame_bytes: usize) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
    thread::spawn(move || handle_client(stream, &manager, client_id, max_frame_bytes));
}
