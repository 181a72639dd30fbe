//! # emesh-id
//!
//! Typed identifiers for the enginemesh orchestration core.
//!
//! ## Design Principles
//!
//! - IDs are typed so a node ID can never be passed where an instance ID is expected
//! - All IDs have a canonical string representation with strict parsing
//! - IDs round-trip through `Display`/`FromStr` and serde
//!
//! ## ID Formats
//!
//! System-generated IDs use a prefixed ULID: `{prefix}_{ulid}`
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Engine instance IDs are derived from what the instance runs:
//! `{sha256(engine_type, config)[..8] as hex}-{start timestamp ms}`
//!
//! - `9f2c61d04be7a311-1718035200123`
//!
//! Engine types are validated lowercase names (`code_analysis`, `codegen.v2`).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
