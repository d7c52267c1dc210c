//! Error types for the operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed key data: {0}")]
    MalformedKeyData(String),

    #[error("unsupported key type {0:?}")]
    UnsupportedKeyType(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("conflicting update to wallet {0}")]
    ResourceConflict(String),

    #[error("wallet keystore for fullnode {fullnode} unavailable: {reason}")]
    KeystoreUnavailable { fullnode: String, reason: String },

    #[error("conflicting write to wallet keystore for fullnode {0}")]
    KeystoreConflict(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;
