//! Error types for vpnmgr

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Configuration source missing or unreadable
    #[error("Configuration unavailable: {0}")]
    ConfigUnavailable(String),
    /// Configuration present but semantically invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// No free client address left in the VPN subnet
    #[error("Address space exhausted in {subnet}")]
    AddressSpaceExhausted { subnet: String },
    /// Required secret or key material absent from a site record
    #[error("Missing credential: {0}")]
    MissingCredential(String),
    /// Companion public value could not be derived from a private key
    #[error("Key derivation unavailable: {0}")]
    DerivationUnavailable(String),
    /// Artifact write failed. Carries the path and the io::ErrorKind only
    /// so the message can never embed file content.
    #[error("Failed to persist {path}: {kind}")]
    PersistenceFailure { path: String, kind: io::ErrorKind },
    /// Bounded probe or daemon query exceeded its deadline
    #[error("Probe timed out: {0}")]
    ProbeTimeout(String),
    /// Command execution failed
    #[error("Command '{cmd}' failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Service error (external tunnel daemon or tool)
    #[error("Service error: {0}")]
    ServiceError(String),
    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for VpnError {
    fn from(error: serde_json::Error) -> Self {
        VpnError::ParseError(error.to_string())
    }
}

impl From<ipnet::AddrParseError> for VpnError {
    fn from(error: ipnet::AddrParseError) -> Self {
        VpnError::InvalidParameter(format!("bad CIDR: {}", error))
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
