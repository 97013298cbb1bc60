use thiserror::Error;

/// Errors produced by the address-range helpers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("Start address {start} is greater than end address {end}")]
    RangeOrder { start: String, end: String },
}
