//! Protocol Error Types

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Message too short: got {got} bytes, need {need}")]
    TooShort { got: usize, need: usize },

    #[error("Header length {length} does not match datagram size {actual}")]
    LengthMismatch { length: u32, actual: usize },

    #[error("Unknown message id {0}")]
    UnknownId(u32),

    #[error("Unknown enum value {value} for {what}")]
    BadEnumValue { what: &'static str, value: u32 },

    #[error("Message exceeds maximum size: {0} bytes")]
    TooLarge(usize),

    #[error("Trailing garbage after message payload: {0} bytes")]
    TrailingBytes(usize),
}
