use axum::{Json, body::Bytes, extract::Extension, http::StatusCode};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::http_link::HttpPassiveLink;
use super::protocol::{
    PromoteRequest, PromoteResponse, ReplicateRequest, StatsResponse, SyncRequest,
};
use crate::codec::operation::OperationCodec;
use crate::entity::active::ActiveMapEntity;
use crate::entity::passive::PassiveMapEntity;
use crate::entity::replication::PassiveLink;
use crate::error::EntityError;

/// The entity a node currently hosts.
#[derive(Clone)]
pub enum NodeRole {
    Active(Arc<ActiveMapEntity>),
    Passive(Arc<PassiveMapEntity>),
}

impl NodeRole {
    pub fn name(&self) -> &'static str {
        match self {
            NodeRole::Active(_) => "active",
            NodeRole::Passive(_) => "passive",
        }
    }
}

/// Shared state behind every handler.
pub struct MapNode {
    role: RwLock<NodeRole>,
    codec: OperationCodec,
}

impl MapNode {
    pub fn new(role: NodeRole) -> Arc<Self> {
        Arc::new(Self {
            role: RwLock::new(role),
            codec: OperationCodec::new(),
        })
    }

    pub async fn role(&self) -> NodeRole {
        self.role.read().await.clone()
    }
}

fn status_for(error: &EntityError) -> StatusCode {
    match error {
        EntityError::Protocol(_) => StatusCode::BAD_REQUEST,
        EntityError::NotPassive => StatusCode::CONFLICT,
        e if e.is_fatal() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

pub async fn handle_map(
    Extension(node): Extension<Arc<MapNode>>,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    let NodeRole::Active(active) = node.role().await else {
        return (StatusCode::CONFLICT, b"not the active node".to_vec());
    };

    match active.invoke(&body).await {
        Ok(response) => (StatusCode::OK, response),
        Err(e) => {
            tracing::error!("Failed to handle map request: {}", e);
            (status_for(&e), e.to_string().into_bytes())
        }
    }
}

pub async fn handle_stats(Extension(node): Extension<Arc<MapNode>>) -> (StatusCode, Json<StatsResponse>) {
    let role = node.role().await;
    let statistics = match &role {
        NodeRole::Active(active) => active.statistics(),
        NodeRole::Passive(passive) => passive.statistics(),
    };
    (
        StatusCode::OK,
        Json(StatsResponse {
            role: role.name().to_string(),
            statistics,
        }),
    )
}

pub async fn handle_replicate(
    Extension(node): Extension<Arc<MapNode>>,
    body: Bytes,
) -> (StatusCode, String) {
    let NodeRole::Passive(passive) = node.role().await else {
        return (StatusCode::CONFLICT, "not a passive node".to_string());
    };

    let request: ReplicateRequest = match bincode::deserialize(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to deserialize replicate request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    let message = match request.into_message(&node.codec) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to decode replicated operation: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match passive.replay(message).await {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(e) => {
            tracing::warn!("Failed to replay: {}", e);
            (status_for(&e), e.to_string())
        }
    }
}

pub async fn handle_sync(
    Extension(node): Extension<Arc<MapNode>>,
    body: Bytes,
) -> (StatusCode, String) {
    let NodeRole::Passive(passive) = node.role().await else {
        return (StatusCode::CONFLICT, "not a passive node".to_string());
    };

    let request: SyncRequest = match bincode::deserialize(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to deserialize sync request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match passive.sync_frame(request.position, &request.frame).await {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(e) => {
            tracing::warn!("Failed to apply sync frame: {}", e);
            (status_for(&e), e.to_string())
        }
    }
}

pub async fn handle_promote(
    Extension(node): Extension<Arc<MapNode>>,
    Json(req): Json<PromoteRequest>,
) -> (StatusCode, Json<PromoteResponse>) {
    let mut role = node.role.write().await;
    let NodeRole::Passive(passive) = role.clone() else {
        return (
            StatusCode::CONFLICT,
            Json(PromoteResponse {
                success: false,
                entries: 0,
            }),
        );
    };

    let timeout = passive.config().replication_timeout();
    let links: Vec<Arc<dyn PassiveLink>> = req
        .passives
        .iter()
        .map(|addr| HttpPassiveLink::new(addr.clone(), timeout) as Arc<dyn PassiveLink>)
        .collect();

    match passive.promote(links).await {
        Ok(active) => {
            let entries = active.len() as u64;
            *role = NodeRole::Active(active);
            tracing::info!("Node promoted to active with {} passives", req.passives.len());
            (
                StatusCode::OK,
                Json(PromoteResponse {
                    success: true,
                    entries,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to promote: {}", e);
            (
                status_for(&e),
                Json(PromoteResponse {
                    success: false,
                    entries: 0,
                }),
            )
        }
    }
}
