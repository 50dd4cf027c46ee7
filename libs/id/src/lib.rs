//! # vmsmoke-id
//!
//! Typed identifiers for the readiness harness.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `ses_01HV4Z2WQXKJNM8GPQY6VBKC3D` (one orchestrated run)
//! - `env_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (one acquired VM)
//!
//! The ULID half keeps IDs time-ordered, so sorting session reports by ID
//! sorts them by start time.

mod macros;
mod types;

pub use types::*;

#[doc(hidden)]
pub use ulid::Ulid;
