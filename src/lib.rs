//! Clustered Map Library
//!
//! A key/value map whose canonical copy lives on an *active* node and is mirrored
//! onto *passive* nodes for failover. The binary (`main.rs`) hosts one node over HTTP.
//!
//! ## Architecture Modules
//! - **`map`**: the operations a client can submit and the responses it gets back.
//! - **`strategy`**: assigns every operation to an ordering domain (concurrency key).
//!   Active and passives compute the same key independently.
//! - **`codec`**: the client operation wire format and the separate, chunked
//!   reconciliation format used to bring a passive up to date.
//! - **`entity`**: the active and passive roles, per-key ordering, replication fan-out,
//!   reconciliation, and promotion.
//! - **`service`**: the factory a host uses to build entities, plus the HTTP glue
//!   between nodes.
//! - **`config`** / **`error`**: entity configuration and failure types.

pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod map;
pub mod service;
pub mod strategy;
