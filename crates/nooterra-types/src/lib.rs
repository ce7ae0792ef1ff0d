//! Nooterra core types - shared identifiers, domain records, and the error
//! taxonomy every other engine crate builds on.
//!
//! # Architectural invariants
//!
//! 1. Every tenant-visible resource is a projection over an append-only,
//!    per-stream event chain (see `nooterra-chain`).
//! 2. Money moves only through balanced, double-entry postings
//!    (see `nooterra-ledger`).
//! 3. Every mutating write is idempotent on `(tenantId, Idempotency-Key)`.
//! 4. Dynamic payloads are untyped JSON (`serde_json::Value`), never a
//!    closed Rust enum, so new event/artifact kinds don't require a
//!    workspace-wide schema migration.

pub mod error;
pub mod ids;
pub mod types;

pub use error::*;
pub use ids::*;
pub use types::*;
