//! Error types shared across the DVB stack.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DvbError>;

/// Errors raised by the tuning, demultiplexing and serving pipeline.
#[derive(Error, Debug)]
pub enum DvbError {
    /// A device node could not be opened or probed.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// The frontend did not reach lock within the retry budget.
    #[error("failed to tune: {0}")]
    TuneFailed(String),

    /// A section or PID filter could not be installed.
    #[error("failed to open filter: {0}")]
    FilterOpenFailed(String),

    /// A PSI section was malformed (bad CRC, length overflow, wrong table).
    #[error("malformed section: {0}")]
    SectionParse(&'static str),

    /// The per-service packet queue overflowed and packets were discarded.
    /// Recovered locally; never crosses the library boundary.
    #[error("packet queue overflow, {dropped} packets dropped")]
    QueueOverflow { dropped: u64 },

    /// No transponder in the catalog carries the requested service.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Every matching frontend is tuned elsewhere with active services.
    #[error("no free frontend for service: {0}")]
    NoFreeFrontend(String),

    /// The catalog XML could not be parsed. Fatal at startup.
    #[error("catalog parse error: {0}")]
    CatalogParse(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::Error> for DvbError {
    fn from(e: quick_xml::Error) -> Self {
        DvbError::CatalogParse(e.to_string())
    }
}
