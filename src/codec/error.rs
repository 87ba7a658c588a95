use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The leading tag byte names no known variant. The stream position can no longer
    /// be trusted, so the channel has to be torn down.
    #[error("unknown tag byte 0x{tag:02x}")]
    UnknownTag { tag: u8 },
    #[error("message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("{trailing} trailing bytes after message")]
    TrailingBytes { trailing: usize },
    #[error("field length {len} does not fit the wire format")]
    LengthOverflow { len: usize },
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("shard {key} incomplete: announced {expected} entries, received {received}")]
    IncompleteShard {
        key: u32,
        expected: u32,
        received: usize,
    },
}

impl CodecError {
    /// Whether the error is fatal to the whole channel rather than to one request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::UnknownTag { .. })
    }
}
