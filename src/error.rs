//! Error types for the harness core.

use thiserror::Error;

/// Errors raised while probing or talking to a server's admin REST API.
///
/// This client is an external collaborator (the server's own admin surface, not
/// part of the harness core); the variants here are only the ones the core needs
/// to distinguish while deciding whether a server is ready.
#[derive(Error, Debug, Clone)]
pub enum AdminApiError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("admin API returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("failed to parse admin API response: {0}")]
    Parse(String),
}

impl AdminApiError {
    /// A 5xx from the admin API is fatal during readiness probing; everything
    /// else (4xx, connection refused, timeout) means "not ready yet".
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdminApiError::Status { code, .. } if *code >= 500)
    }
}

impl From<reqwest::Error> for AdminApiError {
    fn from(err: reqwest::Error) -> Self {
        AdminApiError::Connection(err.to_string())
    }
}

/// Errors produced by the harness core.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("host registry exhausted: no loopback addresses remain in the pool")]
    HostPoolExhausted,

    #[error("failed to provision server {server_id}: {message}")]
    Provisioning { server_id: u64, message: String },

    #[error("server {server_id} failed to start: {diagnostic}")]
    Startup { server_id: u64, diagnostic: String },

    #[error("mutation failed: {0}")]
    Mutation(String),

    #[error("postcondition violation after test {test_name}: {message}")]
    Postcondition { test_name: String, message: String },

    #[error("unknown server id {0}")]
    UnknownServer(u64),

    #[error("unknown cluster")]
    UnknownCluster,

    #[error("admin API error: {0}")]
    AdminApi(#[from] AdminApiError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialization error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("pool exhausted: no clusters available")]
    PoolExhausted,
}

impl HarnessError {
    /// Config/control routes answer unknown ids with 404; mutating control routes
    /// answer everything else (including unknown ids) with 500. This tells callers
    /// which bucket an error falls in.
    pub fn is_unknown_entity(&self) -> bool {
        matches!(self, HarnessError::UnknownServer(_) | HarnessError::UnknownCluster)
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
