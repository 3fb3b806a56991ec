//! Marketplace policy & attestation core.
//!
//! Exposes the core machinery (canonical encoding, clock, errors, the
//! idempotency registry, the ledger, attestation/export, and the dispatch
//! pipeline) plus the domain services built on top of it. The binary in
//! `main.rs` wires these into a thin HTTP surface; everything that matters
//! lives here and is exercised directly by this crate's tests.

pub mod api;
pub mod attestation;
pub mod authz;
pub mod canonical;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod export;
pub mod idempotency;
pub mod ledger;
pub mod store;

pub use config::Config;
pub use error::{CoreError, CoreResult, ErrorCode};
pub use store::Store;
