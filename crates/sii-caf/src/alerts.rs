//! # Folio Stock Alerts
//!
//! Fire-and-forget notifications raised by the manager. A sink must not
//! block and cannot fail the operation that raised the alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sii_core::{Rut, TipoDte};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Alert category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    /// Available folios for a type fell below the threshold.
    #[serde(rename = "CAF_BAJO_STOCK")]
    LowStock,
    /// An authorization ran out of folios.
    #[serde(rename = "CAF_AGOTADO")]
    Exhausted,
    /// An authorization is within the warning window of its expiry date.
    #[serde(rename = "CAF_PROXIMO_VENCER")]
    ExpiringSoon,
    /// An authorization passed its expiry date.
    #[serde(rename = "CAF_VENCIDO")]
    Expired,
}

impl AlertKind {
    /// Wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LowStock => "CAF_BAJO_STOCK",
            Self::Exhausted => "CAF_AGOTADO",
            Self::ExpiringSoon => "CAF_PROXIMO_VENCER",
            Self::Expired => "CAF_VENCIDO",
        }
    }
}

/// A stock notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolioAlert {
    /// Unique alert id.
    pub id: Uuid,
    /// Category.
    pub kind: AlertKind,
    /// Document type concerned.
    pub tipo: TipoDte,
    /// Issuer.
    pub rut_emisor: Rut,
    /// Authorization that triggered the alert, if a single one did.
    pub caf_id: Option<String>,
    /// Folios still available for the type.
    pub available: u64,
    /// Configured low-stock threshold.
    pub threshold: u64,
    /// Human-readable summary.
    pub message: String,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
}

impl FolioAlert {
    /// New alert stamped now.
    pub fn new(
        kind: AlertKind,
        tipo: TipoDte,
        rut_emisor: Rut,
        available: u64,
        threshold: u64,
    ) -> Self {
        let message = match kind {
            AlertKind::LowStock => format!(
                "{available} folios left for document type {} (threshold {threshold})",
                tipo.code()
            ),
            AlertKind::Exhausted => {
                format!("folio authorization for document type {} exhausted", tipo.code())
            }
            AlertKind::ExpiringSoon => {
                format!("folio authorization for document type {} expires soon", tipo.code())
            }
            AlertKind::Expired => {
                format!("folio authorization for document type {} expired", tipo.code())
            }
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            tipo,
            rut_emisor,
            caf_id: None,
            available,
            threshold,
            message,
            created_at: Utc::now(),
        }
    }

    /// Attach the authorization id.
    pub fn for_caf(mut self, id: impl Into<String>) -> Self {
        self.caf_id = Some(id.into());
        self
    }

    /// Replace the summary.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Receiver of [`FolioAlert`]s.
pub trait AlertSink: Send + Sync + std::fmt::Debug {
    /// Deliver an alert. Must return promptly.
    fn notify(&self, alert: FolioAlert);
}

/// Writes alerts as `warn` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: FolioAlert) {
        tracing::warn!(
            code = alert.kind.code(),
            tipo = alert.tipo.code(),
            rut = %alert.rut_emisor,
            caf_id = alert.caf_id.as_deref().unwrap_or("-"),
            available = alert.available,
            threshold = alert.threshold,
            "{}",
            alert.message
        );
    }
}

/// Forwards alerts to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<FolioAlert>,
}

impl ChannelAlertSink {
    /// Sink and the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FolioAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn notify(&self, alert: FolioAlert) {
        if self.tx.send(alert).is_err() {
            tracing::debug!("alert receiver dropped");
        }
    }
}
