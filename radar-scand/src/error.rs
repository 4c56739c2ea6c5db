use thiserror::Error;

/// Command-level failures returned to whoever issues scan commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("scan {scan_id} is already running")]
    AlreadyRunning { scan_id: u64 },

    #[error("scan coordinator is shutting down")]
    ShuttingDown,
}

/// Failures inside a single protocol probe. These never end a scan on their own.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("mDNS daemon error: {0}")]
    Daemon(#[from] mdns_sd::Error),

    #[error("too many consecutive receive errors ({0})")]
    ReceiveBudgetExhausted(u32),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record carries no address")]
    MissingAddress,

    #[error("unparseable address {0:?}")]
    InvalidAddress(String),
}

#[derive(Error, Debug)]
pub enum PublicNetworkError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lookup service answered with status {status}: {message}")]
    Lookup { status: String, message: String },
}
