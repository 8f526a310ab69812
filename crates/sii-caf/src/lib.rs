//! # sii-caf — Folio Authorizations
//!
//! Lifecycle of the authority-issued folio ranges (CAF) that make document
//! numbering legal:
//!
//! - [`parse`]: read `AUTORIZACION` documents into [`Caf`] records.
//! - [`validate`]: expiry, range and authority-signature checks against a
//!   keyring of authority keys indexed by `IDK`.
//! - [`store`], [`fs_store`], [`cache_store`]: one repository trait with a
//!   directory-per-record backend and a key-value cache backend.
//! - [`manager`]: registration, lookup by folio, folio reservation,
//!   availability and expiry sweeps.
//! - [`alerts`]: low-stock, exhaustion and expiry notifications.
//! - [`timbre`]: the `TED` stamp embedded in each document.
//!
//! ## Crate Policy
//!
//! - `folio_inicial` and `folio_final` are never mutated after parsing.
//! - Alerts are fire-and-forget; a failing sink never fails an operation.

#![deny(missing_docs)]

pub mod alerts;
pub mod cache_store;
pub mod error;
pub mod fs_store;
pub mod manager;
pub mod model;
pub mod parse;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod timbre;
pub mod validate;

pub use alerts::{AlertKind, AlertSink, ChannelAlertSink, FolioAlert, TracingAlertSink};
pub use cache_store::CachedCafStore;
pub use error::CafError;
pub use fs_store::FsCafStore;
pub use manager::{
    Availability, CafManager, CafVigencia, FolioReservation, DEFAULT_EXPIRY_WARNING_DAYS,
    DEFAULT_LOW_STOCK_THRESHOLD,
};
pub use model::{Caf, CafState, Vigencia};
pub use parse::{parse_caf, CafXml};
pub use store::CafRepository;
pub use timbre::{build_ted, verify_ted, TimbreData};
pub use validate::{AuthorityKeyring, CafValidator};
