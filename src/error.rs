use thiserror::Error;

/// Top-level daemon errors. Module-specific failure types (wire framing,
/// TLS, payload transfer, pairing) live next to the code that raises them;
/// this enum is what the binary surfaces when startup cannot proceed.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Trust store error: {0}")]
    Trust(#[from] crate::truststore::TrustError),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::network::tls::TlsError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Wire protocol error: {0}")]
    Wire(#[from] crate::message::WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
