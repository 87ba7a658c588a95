//! Concurrency Strategy Module
//!
//! Assigns every map operation to an ordering domain (a *concurrency key*).
//!
//! ## Core Concepts
//! - **Partitioning**: Key-scoped operations hash their key with CRC-32 and reduce it
//!   modulo the shard count. The hash function is part of the entity's versioned
//!   contract, so an active and its passives agree on placement without exchanging
//!   any message.
//! - **Universal key**: Map-wide operations use a reserved key that orders them
//!   against every shard at once.
//! - **Key space**: `all_keys` enumerates every shard plus the universal key and
//!   drives reconciliation of a passive.

pub mod concurrency;
