//! Transports for the admin protocol
//!
//! `AdminRpc` is the seam between `TableOperations` and the service:
//! `LocalClient` dispatches straight into an in-process `TableManager`,
//! `SocketClient` speaks the framed protocol over a Unix socket.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::catalog::TableManager;
use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{AdminError, Result};
use crate::protocol::{
    decode, encode, read_message, write_message, Request, RequestEnvelope, Response,
    ResponseEnvelope,
};
use crate::server::handle_request;
use crate::session::{ClientSession, PROTOCOL_VERSION};

/// One request/response exchange with the admin service.
///
/// Implementations return `Err` only for failures of the exchange itself;
/// service-side failures come back as `Response::Error`.
pub trait AdminRpc: Send + Sync {
    fn call(&self, request: Request) -> Result<Response>;
}

impl<T: AdminRpc + ?Sized> AdminRpc for Arc<T> {
    fn call(&self, request: Request) -> Result<Response> {
        (**self).call(request)
    }
}

// ============================================================================
// In-process
// ============================================================================

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1 << 32);

/// Client bound directly to a manager in the same process.
pub struct LocalClient {
    manager: Arc<TableManager>,
    session: Mutex<ClientSession>,
}

impl LocalClient {
    pub fn new(manager: Arc<TableManager>) -> Self {
        Self {
            manager,
            session: Mutex::new(ClientSession::new(NEXT_LOCAL_ID.fetch_add(1, Ordering::SeqCst))),
        }
    }

    /// Client acting as `principal`.
    pub fn with_principal(manager: Arc<TableManager>, principal: &str) -> Self {
        let client = Self::new(manager);
        client
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .identify(Some(principal.to_string()), PROTOCOL_VERSION);
        client
    }

    pub fn manager(&self) -> &Arc<TableManager> {
        &self.manager
    }
}

impl AdminRpc for LocalClient {
    fn call(&self, request: Request) -> Result<Response> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(handle_request(&self.manager, &mut session, request))
    }
}

// ============================================================================
// Unix socket
// ============================================================================

struct Connection {
    stream: UnixStream,
    next_request_id: u64,
}

/// Client speaking the framed MessagePack protocol over a Unix socket.
///
/// Read-only requests are retried once on a fresh connection when the
/// exchange fails; mutating requests never are, since the server may have
/// applied them.
pub struct SocketClient {
    path: PathBuf,
    principal: Option<String>,
    max_frame_bytes: usize,
    conn: Mutex<Option<Connection>>,
}

impl SocketClient {
    /// Connect and announce `principal` with `hello`.
    pub fn connect(path: impl AsRef<Path>, principal: Option<&str>) -> Result<Self> {
        let mut client = Self {
            path: path.as_ref().to_path_buf(),
            principal: principal.map(str::to_string),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            conn: Mutex::new(None),
        };
        let conn = client.open()?;
        client.conn = Mutex::new(Some(conn));
        Ok(client)
    }

    fn open(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.path).map_err(|e| {
            AdminError::Transport(format!("Cannot connect to {}: {}", self.path.display(), e))
        })?;
        let mut conn = Connection {
            stream,
            next_request_id: 1,
        };
        let hello = Request::Hello {
            protocol_version: Some(PROTOCOL_VERSION),
            principal: self.principal.clone(),
        };
        match self.exchange(&mut conn, hello)?.into_result()? {
            Response::HelloOk { .. } => Ok(conn),
            other => Err(AdminError::Transport(format!("Unexpected hello reply: {:?}", other))),
        }
    }

    fn exchange(&self, conn: &mut Connection, request: Request) -> Result<Response> {
        let request_id = format!("c{}", conn.next_request_id);
        conn.next_request_id += 1;

        let bytes = encode(&RequestEnvelope {
            request_id: Some(request_id.clone()),
            request,
        })?;
        write_message(&mut conn.stream, &bytes)
            .map_err(|e| AdminError::Transport(format!("Send failed: {}", e)))?;

        let reply = read_message(&mut conn.stream, self.max_frame_bytes)
            .map_err(|e| AdminError::Transport(format!("Receive failed: {}", e)))?
            .ok_or_else(|| AdminError::Transport("Server closed the connection".to_string()))?;
        let envelope: ResponseEnvelope = decode(&reply)?;

        if envelope.request_id.as_deref() != Some(request_id.as_str()) {
            return Err(AdminError::Transport(format!(
                "Response id {:?} does not match request {}",
                envelope.request_id, request_id
            )));
        }
        Ok(envelope.response)
    }
}

impl AdminRpc for SocketClient {
    fn call(&self, request: Request) -> Result<Response> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let retryable = request.is_read_only();

        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let first = match guard.as_mut() {
            Some(conn) => self.exchange(conn, request.clone()),
            None => Err(AdminError::Transport("Not connected".to_string())),
        };

        match first {
            Err(AdminError::Transport(msg)) => {
                *guard = None;
                if !retryable {
                    return Err(AdminError::Transport(msg));
                }
                tracing::debug!("retrying {} after transport error: {}", request.operation_name(), msg);
                let mut conn = self.open()?;
                let response = self.exchange(&mut conn, request)?;
                *guard = Some(conn);
                Ok(response)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use crate::catalog::CreateOptions;
    use crate::error::ErrorKind;

    #[test]
    fn test_local_client_dispatches() {
        let manager = Arc::new(TableManager::new());
        let client = LocalClient::with_principal(Arc::clone(&manager), "alice");

        let response = client
            .call(Request::CreateTable {
                name: "t".into(),
                options: CreateOptions::default(),
            })
            .unwrap();
        assert_eq!(response, Response::Ok);
        assert!(manager.table_info("t").unwrap().principals.contains("alice"));
    }

    #[test]
    fn test_local_client_reports_service_errors_in_response() {
        let client = LocalClient::new(Arc::new(TableManager::new()));
        let response = client.call(Request::DeleteTable { name: "t".into() }).unwrap();
        assert_eq!(response.into_result().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_socket_client_connect_failure_is_transport() {
        let dir = tempfile::tempdir().unwrap();
        let err = SocketClient::connect(dir.path().join("absent.sock"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
