use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clustered_map::entity::replication::PassiveStatus;
use clustered_map::service::descriptor::MapEntityService;
use clustered_map::service::handlers::*;
use clustered_map::service::http_link::HttpPassiveLink;
use clustered_map::service::protocol::*;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--role active|passive] [--passive <addr:port>]... [--config <file>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:6001 --role passive", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:6000 --passive 127.0.0.1:6001",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut role = "active".to_string();
    let mut passives: Vec<String> = vec![];
    let mut config_path: Option<String> = None;

    let mut i = 1;
    while i + 1 < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--role" => {
                role = args[i + 1].clone();
                i += 2;
            }
            "--passive" => {
                passives.push(args[i + 1].clone());
                i += 2;
            }
            "--config" => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;
    let configuration = match &config_path {
        Some(path) => tokio::fs::read(path).await?,
        None => Vec::new(),
    };

    tracing::info!("Starting {} node on {}", role, bind_addr);

    // 1. Entity:
    let service = MapEntityService::new();
    let node_role = match role.as_str() {
        "active" => {
            let active = service.construct_active(&configuration)?;
            let timeout = active.config().replication_timeout();
            for addr in &passives {
                let id = active.attach_passive(HttpPassiveLink::new(addr.clone(), timeout));
                tracing::info!("Attached passive {} as {}", addr, id.0);
            }
            NodeRole::Active(active)
        }
        "passive" => {
            if !passives.is_empty() {
                tracing::warn!("--passive is ignored on a passive node");
            }
            NodeRole::Passive(service.construct_passive(&configuration)?)
        }
        other => anyhow::bail!("unknown role '{}', expected active or passive", other),
    };
    let node = MapNode::new(node_role);

    // 2. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_MAP, post(handle_map))
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(ENDPOINT_SYNC, post(handle_sync))
        .route(ENDPOINT_PROMOTE, post(handle_promote))
        .layer(Extension(node.clone()));

    // 3. Spawn stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            match stats_node.role().await {
                NodeRole::Active(active) => {
                    tracing::info!("Map stats: {} entries (active)", active.len());
                    for (id, status) in active.passives() {
                        let status = match status {
                            PassiveStatus::Synced => "synced".to_string(),
                            PassiveStatus::Reconciling(keys) => {
                                format!("reconciling ({} keys done)", keys.len())
                            }
                            PassiveStatus::Lagging => "lagging".to_string(),
                            PassiveStatus::Retired => "retired".to_string(),
                        };
                        tracing::info!("  - passive {} {}", id.0, status);
                    }
                }
                NodeRole::Passive(passive) => {
                    tracing::info!("Map stats: {} entries (passive)", passive.len());
                }
            }
        }
    });

    // 4. Start HTTP server:
    tracing::info!("HTTP server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
