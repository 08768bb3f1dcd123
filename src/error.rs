//! Error types for vizdb
//!
//! This module defines the error hierarchy used throughout the crate.
//! We use `thiserror` for library-style errors with clear error chains.
//!
//! Statement errors are kept separate from session-level errors: a failed
//! statement terminates only that statement, while a `VizdbError` aborts the
//! operation that produced it (resolving a session, submitting a statement).

use std::io;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for vizdb
#[derive(Debug, thiserror::Error)]
pub enum VizdbError {
    /// The physical connection could not be opened
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The SSH tunnel in front of the backend could not be opened
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The driver for this backend kind is not available in this build
    #[error("No driver available for {kind}: {hint}")]
    DriverMissing { kind: String, hint: String },

    /// No provider registered for the requested kind
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// A statement is already in flight on this session
    #[error("Session is busy: a statement is already running")]
    SessionBusy,

    /// The session lost connectivity or was closed
    #[error("Session is no longer usable: {0}")]
    SessionInvalid(String),

    /// A statement failed (used where a statement error aborts an operation)
    #[error(transparent)]
    Statement(#[from] StatementError),

    /// A bounded wait ran out
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Credential store errors
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why a physical connection could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    AuthRejected,
    Unreachable,
    HandshakeFailed,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionFailure::AuthRejected => "authentication rejected",
            ConnectionFailure::Unreachable => "network unreachable",
            ConnectionFailure::HandshakeFailed => "handshake failed",
        })
    }
}

/// Failure to open a physical connection
#[derive(Debug, thiserror::Error)]
#[error("Connection failed ({kind}): {message}")]
pub struct ConnectionError {
    pub kind: ConnectionFailure,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl ConnectionError {
    pub fn new(kind: ConnectionFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ConnectionFailure,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Why an SSH tunnel could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelFailure {
    AuthFailed,
    Unreachable,
    HandshakeFailed,
    ForwardingFailed,
    Unsupported,
}

/// Failure to open an SSH tunnel
#[derive(Debug, thiserror::Error)]
#[error("SSH tunnel failed ({kind:?}): {message}")]
pub struct TunnelError {
    pub kind: TunnelFailure,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl TunnelError {
    pub fn new(kind: TunnelFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: TunnelFailure,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Normalized statement errors
///
/// These are `Clone` because the final status of a statement is observed by
/// every holder of the statement handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Connectivity lost: {0}")]
    ConnectivityLost(String),

    #[error("Statement timed out: {0}")]
    Timeout(String),

    #[error("{message}")]
    Driver {
        message: String,
        code: Option<String>,
    },
}

impl StatementError {
    pub fn driver(message: impl Into<String>) -> Self {
        StatementError::Driver {
            message: message.into(),
            code: None,
        }
    }

    /// Whether this error means the session's physical connection is gone
    pub fn is_connectivity_lost(&self) -> bool {
        matches!(self, StatementError::ConnectivityLost(_))
    }
}

/// Credential store errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The selected backend cannot be reached (no keyring daemon, etc.)
    #[error("Credential backend unavailable: {0}")]
    Unavailable(String),

    /// Plaintext storage was selected without consent
    #[error("Plaintext credential storage requires explicit consent")]
    ConsentRequired,

    /// Encrypted file could not be decrypted
    #[error("Failed to decrypt credential file: {0}")]
    Decrypt(String),

    /// Backing storage failed
    #[error("Credential storage failed: {0}")]
    Storage(String),
}

/// Configuration loading/parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Home directory not found
    #[error("Could not determine home directory")]
    NoHomeDir,

    /// Failed to read or write a config file
    #[error("Failed to access {path}: {source}")]
    Access {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("Failed to write configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Connection profile not found
    #[error("Connection profile '{0}' not found")]
    ProfileNotFound(String),

    /// A profile with this name already exists
    #[error("Connection profile '{0}' already exists")]
    DuplicateProfile(String),

    /// Attempted to change a profile's backend kind
    #[error("Backend kind of profile '{0}' cannot be changed")]
    KindImmutable(String),
}

/// Specialized Result type for vizdb operations
pub type Result<T> = std::result::Result<T, VizdbError>;

/// Specialized Result type for statement execution
pub type StatementResult<T> = std::result::Result<T, StatementError>;

/// Specialized Result type for credential operations
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Specialized Result type for config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
