use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the registry client
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors, fatal at construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// The resolved server list is empty
    #[error("No registry hosts available")]
    NoHosts,

    /// Every host failed at the transport level; carries the last failure
    #[error("All registry hosts exhausted requesting {path}: {source}")]
    AllHostsExhausted {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// Transport-level failure (connection, DNS, TLS, timeout)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The registry answered with a non-success code
    #[error("Registry error {code}: {message}")]
    Api { code: i64, message: String },

    /// Response body could not be interpreted
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Disk cache / failover I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True when retrying another host could help.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::AllHostsExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_carries_code_and_message() {
        let err = Error::Api { code: 403, message: "unauthorized".to_string() };
        assert_eq!(err.to_string(), "Registry error 403: unauthorized");
    }

    #[test]
    fn no_hosts_is_not_transport() {
        assert!(!Error::NoHosts.is_transport());
    }
}
