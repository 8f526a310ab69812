//! # sii-core — Foundational Types for the SII Client
//!
//! Shared vocabulary for every other crate in the workspace: the error
//! taxonomy, taxpayer and environment identifiers, document types, the
//! authority's status codes, and signature algorithm identifiers.
//!
//! ## Key Design Principles
//!
//! 1. **One tagged error type.** [`SiiError`] carries an [`ErrorKind`] from a
//!    closed taxonomy plus an optional wrapped cause. Retry decisions are
//!    made from the kind alone.
//!
//! 2. **Validated identifiers.** A [`Rut`] always has a correct check digit.
//!    A [`TipoDte`] is always a code the authority knows.
//!
//! 3. **Explicit algorithms.** [`DigestAlgorithm`] is passed per call. Nothing
//!    in the workspace hard-codes SHA-1 or SHA-256.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `sii-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

#![deny(missing_docs)]

pub mod algorithm;
pub mod document;
pub mod environment;
pub mod error;
pub mod identity;
pub mod status;

pub use algorithm::DigestAlgorithm;
pub use document::TipoDte;
pub use environment::{Ambiente, Endpoint};
pub use error::{BoxError, ErrorKind, Rejection, Result, SiiError};
pub use identity::Rut;
pub use status::{
    map_status, DocumentCounts, DocumentStatus, EstadoSii, MappedStatus, StatusCategory,
    SubmissionStatus,
};
