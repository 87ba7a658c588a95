//! Map Entity Module
//!
//! The two stateful roles of a clustered map and the machinery between them.
//!
//! ## Architecture Overview
//! 1. **Execution**: The `ActiveMapEntity` runs every client operation under its
//!    concurrency key. Operations on one shard are strictly ordered; different shards
//!    run in parallel; map-wide operations drain everything first (`lanes`).
//! 2. **Replication**: While still holding the lane, the active queues the operation,
//!    tagged with its key and per-lane sequence number, to every passive. By default the
//!    client is answered only after synced passives applied it.
//! 3. **Reconciliation**: A passive that joins or falls behind is brought up to date
//!    lane by lane from point-in-time snapshots, streamed as chunked frames. The passive
//!    buffers live operations for a lane until its snapshot is complete.
//! 4. **Promotion**: A passive's state becomes the active's state as-is.
//!
//! ## Submodules
//! - **`active`** / **`passive`**: the two entity roles.
//! - **`lanes`**: per-key FIFO ordering plus the universal barrier.
//! - **`replication`**: per-passive delivery queues, status, and the `PassiveLink` seam.
//! - **`state`**: the sharded store and per-lane bookkeeping shared by both roles.
//! - **`stats`**: operation counters.

pub mod active;
pub mod lanes;
pub mod passive;
pub mod replication;
pub mod state;
pub mod stats;

#[cfg(test)]
mod tests;
