//! RFQ / bid negotiation and agreement acceptance for the Nooterra
//! marketplace.

pub mod registry;

pub use registry::*;
