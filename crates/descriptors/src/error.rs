//! Descriptor parsing errors

use thiserror::Error;

/// Malformed descriptor data
///
/// Every variant names the descriptor kind and the byte counts involved so a
/// bad dump can be diagnosed from the message alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Buffer ends before the descriptor does
    #[error("Truncated {kind} descriptor: needed {needed} bytes, got {available}")]
    Truncated {
        kind: &'static str,
        needed: usize,
        available: usize,
    },

    /// bLength field is smaller than the descriptor kind allows
    #[error("Invalid bLength {length} for {kind} descriptor (minimum {minimum})")]
    InvalidLength {
        kind: &'static str,
        length: u8,
        minimum: u8,
    },

    /// bDescriptorType does not match what the caller asked to parse
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, found: u8 },

    /// Configuration wTotalLength is larger than the supplied buffer
    #[error("Configuration wTotalLength {declared} exceeds buffer of {available} bytes")]
    TotalLengthMismatch { declared: usize, available: usize },

    /// An endpoint descriptor appeared before any interface descriptor
    #[error("Endpoint descriptor at offset {offset} precedes any interface descriptor")]
    OrphanEndpoint { offset: usize },

    /// An interface declared a different number of endpoints than followed it
    #[error(
        "Interface {interface} alt setting {alt_setting} declares {declared} endpoints, found {found}"
    )]
    EndpointCountMismatch {
        interface: u8,
        alt_setting: u8,
        declared: u8,
        found: usize,
    },

    /// String descriptor payload is not a whole number of UTF-16 code units
    #[error("String descriptor payload has odd length {0}")]
    OddStringLength(usize),
}

/// Type alias for descriptor results
pub type Result<T> = std::result::Result<T, DescriptorError>;
