//! ClientSession - Per-connection state management
//!
//! Each client connection to the admin server has its own session that
//! tracks who the client says it is and which protocol version it speaks.
//! The principal is recorded on tables the client creates, clones or
//! imports.

/// Unique client connection ID
pub type ClientId = u64;

/// Principal used until the client identifies itself with `hello`.
pub const ANONYMOUS_PRINCIPAL: &str = "anonymous";

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Session state for a client connection
///
/// Created when a client connects and destroyed when they disconnect.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Unique client ID for this connection
    pub id: ClientId,
    principal: Option<String>,
    /// Protocol version negotiated with client
    pub protocol_version: u32,
}

impl ClientSession {
    /// Create a new, anonymous session for a client connection
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            principal: None,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Record the principal announced by the client. Empty names are ignored.
    pub fn identify(&mut self, principal: Option<String>, protocol_version: u32) {
        self.principal = principal.filter(|p| !p.trim().is_empty());
        self.protocol_version = protocol_version;
    }

    pub fn principal(&self) -> &str {
        self.principal.as_deref().unwrap_or(ANONYMOUS_PRINCIPAL)
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal.is_none()
    }
}
