//! # sii-client — Authority Web Services
//!
//! Everything between signed documents and the authority:
//!
//! - [`config`]: `SII_*` environment / YAML configuration.
//! - [`context`]: per-call cancellation, deadline and session token.
//! - [`retry`]: bounded exponential backoff over retryable errors.
//! - [`soap`] and [`transport`]: envelopes, reply parsing and the HTTP
//!   transport with status and fault mapping.
//! - [`token_cache`] and [`session`]: seed/token exchange with
//!   single-flight refresh.
//! - [`dte`], [`envelope`], [`schema`]: document and envelope builders and
//!   structural validation.
//! - [`submission`]: submit, poll and query.
//! - [`client`]: assembly from configuration.
//!
//! ## Crate Policy
//!
//! - Every blocking operation takes a [`CallContext`] and stops on its
//!   cancellation or deadline.
//! - Only `Timeout`, `Conexion` and `Servidor` errors are retried.
//! - Tokens and passwords never reach `Debug` output or logs.

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod context;
pub mod dte;
pub mod envelope;
pub mod retry;
pub mod schema;
pub mod session;
pub mod soap;
pub mod submission;
pub mod token_cache;
pub mod transport;

pub use client::{caf_manager, open_store, SiiClient};
pub use config::{ConfigError, Secret, SiiConfig};
pub use context::CallContext;
pub use dte::{Detalle, Documento, DteBuilder, Emisor, IdDoc, Receptor, Totales};
pub use envelope::{build_envio, Caratula};
pub use retry::RetryConfig;
pub use schema::SchemaRules;
pub use session::{SessionManager, SessionPhase};
pub use soap::{Respuesta, UploadAck};
pub use submission::{DocumentQuery, Sender, SubmissionClient};
pub use token_cache::{TokenCache, TokenData};
pub use transport::{HttpTransport, SoapRequest, Transport, UploadRequest};
