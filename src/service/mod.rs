//! Service Module
//!
//! Everything between the map entities and a hosting process.
//!
//! ## Components
//! - **`descriptor`**: `MapEntityService`, the factory a host uses to recognise the
//!   entity type and build actives, passives, codecs, and the concurrency strategy.
//! - **`protocol`**: HTTP endpoints and the DTOs exchanged between nodes.
//! - **`handlers`**: axum handlers serving one node in either role.
//! - **`http_link`**: `HttpPassiveLink`, a `PassiveLink` that reaches a remote passive
//!   over HTTP.
//!
//! The entities themselves never touch the network; only this module does.

pub mod descriptor;
pub mod handlers;
pub mod http_link;
pub mod protocol;
