//! Operation channel codec.
//!
//! ```text
//! request:  [opcode u8][fields...]
//! response: [status u8][fields...]
//! ```
//!
//! Byte strings are `[len u32 BE][bytes]`; an optional value uses `len = 0xFFFF_FFFF`
//! for "absent".

use super::error::CodecError;
use super::wire::{Reader, len_u32, put_bytes, put_optional_bytes, put_u8, put_u32, put_u64};
use crate::map::types::{Entry, ErrorKind, MapOperation, MapResponse};

pub const OP_PUT: u8 = 1;
pub const OP_GET: u8 = 2;
pub const OP_REMOVE: u8 = 3;
pub const OP_CLEAR: u8 = 4;
pub const OP_SIZE: u8 = 5;
pub const OP_PUT_IF_ABSENT: u8 = 6;
pub const OP_REPLACE: u8 = 7;
pub const OP_CONDITIONAL_REMOVE: u8 = 8;
pub const OP_CONDITIONAL_REPLACE: u8 = 9;
pub const OP_CONTAINS_KEY: u8 = 10;
pub const OP_CONTAINS_VALUE: u8 = 11;
pub const OP_ENTRIES: u8 = 12;

pub const STATUS_OK_VALUE: u8 = 0;
pub const STATUS_OK_COUNT: u8 = 1;
pub const STATUS_OK_VOID: u8 = 2;
pub const STATUS_ERROR: u8 = 3;
pub const STATUS_OK_BOOL: u8 = 4;
pub const STATUS_OK_ENTRIES: u8 = 5;

/// Encoder/decoder for the steady-state client channel. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationCodec;

impl OperationCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode_operation(&self, operation: &MapOperation) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(16);
        match operation {
            MapOperation::Put { key, value } => {
                put_u8(&mut buf, OP_PUT);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            MapOperation::Get { key } => {
                put_u8(&mut buf, OP_GET);
                put_bytes(&mut buf, key)?;
            }
            MapOperation::Remove { key } => {
                put_u8(&mut buf, OP_REMOVE);
                put_bytes(&mut buf, key)?;
            }
            MapOperation::Clear => put_u8(&mut buf, OP_CLEAR),
            MapOperation::Size => put_u8(&mut buf, OP_SIZE),
            MapOperation::PutIfAbsent { key, value } => {
                put_u8(&mut buf, OP_PUT_IF_ABSENT);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            MapOperation::Replace { key, value } => {
                put_u8(&mut buf, OP_REPLACE);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            MapOperation::ConditionalRemove { key, value } => {
                put_u8(&mut buf, OP_CONDITIONAL_REMOVE);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            MapOperation::ConditionalReplace {
                key,
                old_value,
                new_value,
            } => {
                put_u8(&mut buf, OP_CONDITIONAL_REPLACE);
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, old_value)?;
                put_bytes(&mut buf, new_value)?;
            }
            MapOperation::ContainsKey { key } => {
                put_u8(&mut buf, OP_CONTAINS_KEY);
                put_bytes(&mut buf, key)?;
            }
            MapOperation::ContainsValue { value } => {
                put_u8(&mut buf, OP_CONTAINS_VALUE);
                put_bytes(&mut buf, value)?;
            }
            MapOperation::Entries => put_u8(&mut buf, OP_ENTRIES),
        }
        Ok(buf)
    }

    /// Decodes one request. An unknown opcode yields the fatal
    /// [`CodecError::UnknownTag`]; every other failure is per-request.
    pub fn decode_operation(&self, bytes: &[u8]) -> Result<MapOperation, CodecError> {
        let mut reader = Reader::new(bytes);
        let opcode = reader.u8()?;
        let operation = match opcode {
            OP_PUT => MapOperation::Put {
                key: reader.bytes()?,
                value: reader.bytes()?,
            },
            OP_GET => MapOperation::Get {
                key: reader.bytes()?,
            },
            OP_REMOVE => MapOperation::Remove {
                key: reader.bytes()?,
            },
            OP_CLEAR => MapOperation::Clear,
            OP_SIZE => MapOperation::Size,
            OP_PUT_IF_ABSENT => MapOperation::PutIfAbsent {
                key: reader.bytes()?,
                value: reader.bytes()?,
            },
            OP_REPLACE => MapOperation::Replace {
                key: reader.bytes()?,
                value: reader.bytes()?,
            },
            OP_CONDITIONAL_REMOVE => MapOperation::ConditionalRemove {
                key: reader.bytes()?,
                value: reader.bytes()?,
            },
            OP_CONDITIONAL_REPLACE => MapOperation::ConditionalReplace {
                key: reader.bytes()?,
                old_value: reader.bytes()?,
                new_value: reader.bytes()?,
            },
            OP_CONTAINS_KEY => MapOperation::ContainsKey {
                key: reader.bytes()?,
            },
            OP_CONTAINS_VALUE => MapOperation::ContainsValue {
                value: reader.bytes()?,
            },
            OP_ENTRIES => MapOperation::Entries,
            tag => return Err(CodecError::UnknownTag { tag }),
        };
        reader.finish()?;
        Ok(operation)
    }

    pub fn encode_response(&self, response: &MapResponse) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(16);
        match response {
            MapResponse::Value(value) => {
                put_u8(&mut buf, STATUS_OK_VALUE);
                put_optional_bytes(&mut buf, value.as_deref())?;
            }
            MapResponse::Count(count) => {
                put_u8(&mut buf, STATUS_OK_COUNT);
                put_u64(&mut buf, *count);
            }
            MapResponse::Void => put_u8(&mut buf, STATUS_OK_VOID),
            MapResponse::Bool(flag) => {
                put_u8(&mut buf, STATUS_OK_BOOL);
                put_u8(&mut buf, u8::from(*flag));
            }
            MapResponse::Entries(entries) => {
                put_u8(&mut buf, STATUS_OK_ENTRIES);
                put_u32(&mut buf, len_u32(entries.len())?);
                for entry in entries {
                    put_bytes(&mut buf, &entry.key)?;
                    put_bytes(&mut buf, &entry.value)?;
                }
            }
            MapResponse::Error { kind, message } => {
                put_u8(&mut buf, STATUS_ERROR);
                put_u8(&mut buf, kind.to_byte());
                put_bytes(&mut buf, message.as_bytes())?;
            }
        }
        Ok(buf)
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<MapResponse, CodecError> {
        let mut reader = Reader::new(bytes);
        let status = reader.u8()?;
        let response = match status {
            STATUS_OK_VALUE => MapResponse::Value(reader.optional_bytes()?),
            STATUS_OK_COUNT => MapResponse::Count(reader.u64()?),
            STATUS_OK_VOID => MapResponse::Void,
            STATUS_OK_BOOL => match reader.u8()? {
                0 => MapResponse::Bool(false),
                1 => MapResponse::Bool(true),
                other => {
                    return Err(CodecError::InvalidField {
                        field: "bool",
                        reason: format!("expected 0 or 1, got {}", other),
                    });
                }
            },
            STATUS_OK_ENTRIES => {
                let count = reader.u32()? as usize;
                // Never trust the count for allocation; each entry is at least 8 bytes.
                let mut entries = Vec::with_capacity(count.min(reader.remaining() / 8));
                for _ in 0..count {
                    let key = reader.bytes()?;
                    let value = reader.bytes()?;
                    entries.push(Entry { key, value });
                }
                MapResponse::Entries(entries)
            }
            STATUS_ERROR => {
                let kind_byte = reader.u8()?;
                let kind = ErrorKind::from_byte(kind_byte).ok_or_else(|| {
                    CodecError::InvalidField {
                        field: "error kind",
                        reason: format!("unknown kind {}", kind_byte),
                    }
                })?;
                let message = String::from_utf8(reader.bytes()?).map_err(|e| {
                    CodecError::InvalidField {
                        field: "error message",
                        reason: e.to_string(),
                    }
                })?;
                MapResponse::Error { kind, message }
            }
            tag => return Err(CodecError::UnknownTag { tag }),
        };
        reader.finish()?;
        Ok(response)
    }
}
