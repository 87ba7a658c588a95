use serde::{Deserialize, Serialize};

/// A single key/value pair, as stored in a shard and shipped during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Bytes this entry occupies on the reconciliation wire (two length prefixes included).
    pub fn encoded_len(&self) -> usize {
        8 + self.key.len() + self.value.len()
    }
}

/// A request against the map, as decoded from the operation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Remove { key: Vec<u8> },
    Clear,
    Size,
    PutIfAbsent { key: Vec<u8>, value: Vec<u8> },
    /// Overwrites only when the key is already present.
    Replace { key: Vec<u8>, value: Vec<u8> },
    ConditionalRemove { key: Vec<u8>, value: Vec<u8> },
    ConditionalReplace {
        key: Vec<u8>,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
    ContainsKey { key: Vec<u8> },
    ContainsValue { value: Vec<u8> },
    Entries,
}

impl MapOperation {
    /// The key this operation is scoped to, or `None` for map-wide operations.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            MapOperation::Put { key, .. }
            | MapOperation::Get { key }
            | MapOperation::Remove { key }
            | MapOperation::PutIfAbsent { key, .. }
            | MapOperation::Replace { key, .. }
            | MapOperation::ConditionalRemove { key, .. }
            | MapOperation::ConditionalReplace { key, .. }
            | MapOperation::ContainsKey { key } => Some(key),
            MapOperation::Clear
            | MapOperation::Size
            | MapOperation::ContainsValue { .. }
            | MapOperation::Entries => None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.key().is_none()
    }

    /// Whether executing this operation can change map contents.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            MapOperation::Put { .. }
                | MapOperation::Remove { .. }
                | MapOperation::Clear
                | MapOperation::PutIfAbsent { .. }
                | MapOperation::Replace { .. }
                | MapOperation::ConditionalRemove { .. }
                | MapOperation::ConditionalReplace { .. }
        )
    }

    /// Stable lowercase name, used for statistics and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MapOperation::Put { .. } => "put",
            MapOperation::Get { .. } => "get",
            MapOperation::Remove { .. } => "remove",
            MapOperation::Clear => "clear",
            MapOperation::Size => "size",
            MapOperation::PutIfAbsent { .. } => "put_if_absent",
            MapOperation::Replace { .. } => "replace",
            MapOperation::ConditionalRemove { .. } => "conditional_remove",
            MapOperation::ConditionalReplace { .. } => "conditional_replace",
            MapOperation::ContainsKey { .. } => "contains_key",
            MapOperation::ContainsValue { .. } => "contains_value",
            MapOperation::Entries => "entries",
        }
    }

    /// Every value payload carried by the operation, for size-limit checks.
    pub fn values(&self) -> Vec<&[u8]> {
        match self {
            MapOperation::Put { value, .. }
            | MapOperation::PutIfAbsent { value, .. }
            | MapOperation::Replace { value, .. }
            | MapOperation::ConditionalRemove { value, .. }
            | MapOperation::ContainsValue { value } => vec![value],
            MapOperation::ConditionalReplace {
                old_value,
                new_value,
                ..
            } => vec![old_value, new_value],
            _ => vec![],
        }
    }
}

/// Every operation kind, in opcode order. Statistics are keyed by these names.
pub const OPERATION_KINDS: [&str; 12] = [
    "put",
    "get",
    "remove",
    "clear",
    "size",
    "put_if_absent",
    "replace",
    "conditional_remove",
    "conditional_replace",
    "contains_key",
    "contains_value",
    "entries",
];

/// Category of a per-request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Truncated or otherwise invalid fields in an operation with a known tag.
    MalformedRequest,
    /// Key or value above the configured size limit.
    PayloadTooLarge,
    /// The entity cannot serve the request (e.g. it failed fatally).
    Unavailable,
}

impl ErrorKind {
    pub fn to_byte(self) -> u8 {
        match self {
            ErrorKind::MalformedRequest => 1,
            ErrorKind::PayloadTooLarge => 2,
            ErrorKind::Unavailable => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ErrorKind::MalformedRequest),
            2 => Some(ErrorKind::PayloadTooLarge),
            3 => Some(ErrorKind::Unavailable),
            _ => None,
        }
    }
}

/// The result of executing a [`MapOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapResponse {
    /// `Get` result, or the previous value for `Put`/`Remove`/`PutIfAbsent`/`Replace`.
    Value(Option<Vec<u8>>),
    Count(u64),
    Void,
    Bool(bool),
    Entries(Vec<Entry>),
    Error { kind: ErrorKind, message: String },
}

impl MapResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        MapResponse::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MapResponse::Error { .. })
    }
}
