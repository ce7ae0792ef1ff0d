//! Canonical JSON encoding and content addressing.
//!
//! `canonicalize` produces an RFC-8785-flavored byte string: object keys
//! sorted by UTF-16 code unit, no insignificant whitespace, numbers
//! rendered in their shortest round-tripping form, and non-finite floats
//! rejected rather than silently coerced.

pub mod canon;
pub mod merkle;

pub use canon::{canonicalize, canonicalize_to_string, content_hash, sha256_hex, CanonError};
pub use merkle::{merkle_proof, merkle_root, verify_merkle_proof, MerkleStep};
