use crate::codec::error::CodecError;
use crate::strategy::concurrency::ConcurrencyKey;

use thiserror::Error;

/// Failures surfaced to the hosting framework.
///
/// Per-request problems (malformed fields, oversized payloads) are not errors at this
/// level; they travel back to the client as `MapResponse::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    /// The channel delivered something the codec cannot resynchronize after.
    #[error("protocol failure: {0}")]
    Protocol(#[from] CodecError),
    #[error("universal barrier not acquired within {waited_ms} ms")]
    BarrierTimeout { waited_ms: u64 },
    /// A previous fatal failure left the entity unusable.
    #[error("entity failed and must be restarted")]
    Poisoned,
    #[error("operation routed to {received} but local strategy says {expected}")]
    KeyMismatch {
        expected: ConcurrencyKey,
        received: ConcurrencyKey,
    },
    #[error("sequence gap on {key}: last applied {last}, received {received}")]
    SequenceGap {
        key: ConcurrencyKey,
        last: u64,
        received: u64,
    },
    #[error("reconciliation of {key} incomplete: {reason}")]
    IncompleteSync { key: ConcurrencyKey, reason: String },
    #[error("{key} is outside the key space of this entity")]
    UnknownKey { key: ConcurrencyKey },
    #[error("entity is no longer passive")]
    NotPassive,
    #[error("configuration error: {0}")]
    Config(String),
}

impl EntityError {
    /// Whether the host should restart or fail over the entity.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EntityError::Protocol(_) | EntityError::BarrierTimeout { .. } | EntityError::Poisoned
        )
    }
}
