//! Node-to-node HTTP protocol.
//!
//! Client traffic travels as raw codec bytes. Replicated operations and
//! reconciliation frames are wrapped in bincode DTOs ([`ReplicateRequest`],
//! [`SyncRequest`]) so the lane tag, sequence, or transfer position ride along with
//! the encoded payload.

use crate::codec::error::CodecError;
use crate::codec::operation::OperationCodec;
use crate::entity::replication::{ReplicatedOperation, SyncPosition};
use crate::strategy::concurrency::ConcurrencyKey;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- API Endpoints ---

/// Client channel: operation bytes in, response bytes out. Active only.
pub const ENDPOINT_MAP: &str = "/map";
/// Statistics of the local entity, as JSON.
pub const ENDPOINT_STATS: &str = "/stats";
/// One replicated operation, active to passive.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// One reconciliation frame, active to passive.
pub const ENDPOINT_SYNC: &str = "/internal/sync";
/// Turns a passive node into the active.
pub const ENDPOINT_PROMOTE: &str = "/internal/promote";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    /// Concurrency key the active executed the operation under.
    pub key: u32,
    pub sequence: u64,
    /// The operation in client-channel encoding.
    pub operation: Vec<u8>,
}

impl ReplicateRequest {
    pub fn from_message(
        codec: &OperationCodec,
        message: &ReplicatedOperation,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            key: message.key.0,
            sequence: message.sequence,
            operation: codec.encode_operation(&message.operation)?,
        })
    }

    pub fn into_message(self, codec: &OperationCodec) -> Result<ReplicatedOperation, CodecError> {
        Ok(ReplicatedOperation {
            key: ConcurrencyKey(self.key),
            sequence: self.sequence,
            operation: codec.decode_operation(&self.operation)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub position: SyncPosition,
    /// One frame in reconciliation-channel encoding.
    pub frame: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromoteRequest {
    /// HTTP addresses of the nodes that become passives of the promoted active.
    pub passives: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromoteResponse {
    pub success: bool,
    pub entries: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub role: String,
    pub statistics: BTreeMap<String, u64>,
}
