use thiserror::Error;

/// Reasons a scan request is rejected before any probe is dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port out of range: {port} (expected 1-65535)")]
    PortOutOfRange { port: u32 },

    #[error("invalid range {start}-{end} (start > end)")]
    InvertedRange { start: u16, end: u16 },

    #[error("per-attempt timeout must be greater than zero")]
    ZeroTimeout,

    #[error("invalid port value: {value:?}")]
    InvalidPort { value: String },
}
