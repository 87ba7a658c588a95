//! Wire Codecs
//!
//! Two independent binary formats:
//!
//! - **`operation`**: the steady-state request/response channel. One leading tag byte
//!   selects the variant; keys and values are `u32` length-prefixed (big-endian).
//! - **`sync`**: the reconciliation channel. Bulk shard contents are split into
//!   frames of bounded size, each tagged with its concurrency key, and closed by an
//!   explicit end-of-shard frame.
//!
//! Both formats share the cursor helpers in `wire`.

pub mod error;
pub mod operation;
pub mod sync;
mod wire;
