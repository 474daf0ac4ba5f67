use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GjallarError>;

/// Unified error type for the Gjallar DNS forwarder
#[derive(Debug, Clone, Error)]
pub enum GjallarError {
    // IO errors
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Configuration errors
    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),
    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),
    #[error("Unsupported upstream protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
    #[error("Invalid local record: {0}")]
    InvalidLocalRecord(String),
    #[error("Invalid blocklist rule: {0}")]
    InvalidBlocklistRule(String),
    #[error("Invalid time window: {0}")]
    InvalidTimeWindow(String),
    #[error("Configuration parse error: {0}")]
    ConfigParseError(String),

    // DNS wire errors
    #[error("Invalid DNS header")]
    InvalidHeader,
    #[error("Invalid DNS label")]
    InvalidLabel,
    #[error("Invalid question section")]
    InvalidQuestionSection,
    #[error("Invalid resource record")]
    InvalidResourceRecord,
    #[error("Packet truncated at offset {0}")]
    PacketTruncated(usize),
    #[error("Parse error: {0}")]
    ParseError(String),

    // Resolution errors
    #[error("Operation timed out")]
    Timeout,
    #[error("All upstreams failed: {0}")]
    AllUpstreamsFailed(String),
    #[error("Upstream returned SERVFAIL")]
    UpstreamServfail,

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Redis error: {0}")]
    Redis(String),

    // Blocklist errors
    #[error("Blocklist fetch failed: {0}")]
    BlocklistFetch(String),

    // Server state errors
    #[error("Server is shutting down")]
    ServerShutdown,
}

impl From<std::io::Error> for GjallarError {
    fn from(err: std::io::Error) -> Self {
        GjallarError::IoError(Arc::new(err))
    }
}

impl From<redis::RedisError> for GjallarError {
    fn from(err: redis::RedisError) -> Self {
        GjallarError::Redis(err.to_string())
    }
}
