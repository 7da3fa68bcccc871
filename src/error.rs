//! Error types for the operator API proxy

/// Result type for the proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Configuration error, fatal at startup
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request path could not be interpreted
    #[error("Request info error: {0}")]
    RequestInfoError(String),

    /// Owner identity present but undecodable
    #[error("Owner reference error: {0}")]
    OwnerReferenceError(String),

    /// Discovery call failed
    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    /// Kind still unknown after a discovery refresh
    #[error("unable to get api resource for kind: {0}")]
    ApiResourceNotFound(String),

    /// No routing mapping for a resource or kind
    #[error("no matches for {0}")]
    NoMatch(String),

    /// Owner kind has no entry in the controller map
    #[error("failed to find controller in map: {0}")]
    ControllerNotFound(String),

    /// Underlying watch registration failed
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Local informer cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// List options in the query string could not be decoded
    #[error("Invalid list options: {0}")]
    ListOptionsError(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Socket error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
