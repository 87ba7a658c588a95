//! Map Data Model
//!
//! The closed set of requests a client can submit against the clustered map and
//! the responses the active entity produces for them.
//!
//! ## Scope
//! - **Key-scoped operations** (`Put`, `Get`, `Remove`, ...) touch exactly one key and
//!   are ordered per shard.
//! - **Global operations** (`Clear`, `Size`, `ContainsValue`, `Entries`) observe or mutate
//!   the whole map and run behind the universal barrier.
//!
//! Keys and values are opaque byte strings; nothing in this crate interprets them.

pub mod types;
