//! # Document Types
//!
//! Electronic tax document types recognised by the authority, keyed by
//! their numeric code.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SiiError};

/// Electronic tax document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum TipoDte {
    /// 33: electronic invoice.
    FacturaElectronica,
    /// 34: exempt electronic invoice.
    FacturaExenta,
    /// 39: electronic receipt.
    BoletaElectronica,
    /// 41: exempt electronic receipt.
    BoletaExenta,
    /// 43: electronic settlement invoice.
    LiquidacionFactura,
    /// 46: electronic purchase invoice.
    FacturaCompra,
    /// 52: electronic dispatch guide.
    GuiaDespacho,
    /// 56: electronic debit note.
    NotaDebito,
    /// 61: electronic credit note.
    NotaCredito,
    /// 110: export invoice.
    FacturaExportacion,
    /// 111: export debit note.
    NotaDebitoExportacion,
    /// 112: export credit note.
    NotaCreditoExportacion,
}

impl TipoDte {
    /// Every supported type.
    pub const ALL: [TipoDte; 12] = [
        Self::FacturaElectronica,
        Self::FacturaExenta,
        Self::BoletaElectronica,
        Self::BoletaExenta,
        Self::LiquidacionFactura,
        Self::FacturaCompra,
        Self::GuiaDespacho,
        Self::NotaDebito,
        Self::NotaCredito,
        Self::FacturaExportacion,
        Self::NotaDebitoExportacion,
        Self::NotaCreditoExportacion,
    ];

    /// Numeric code used on the wire.
    pub fn code(&self) -> u16 {
        match self {
            Self::FacturaElectronica => 33,
            Self::FacturaExenta => 34,
            Self::BoletaElectronica => 39,
            Self::BoletaExenta => 41,
            Self::LiquidacionFactura => 43,
            Self::FacturaCompra => 46,
            Self::GuiaDespacho => 52,
            Self::NotaDebito => 56,
            Self::NotaCredito => 61,
            Self::FacturaExportacion => 110,
            Self::NotaDebitoExportacion => 111,
            Self::NotaCreditoExportacion => 112,
        }
    }

    /// Look up a type by its code.
    pub fn from_code(code: u16) -> Result<Self, SiiError> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or_else(|| {
                SiiError::new(
                    ErrorKind::DocumentoInvalido,
                    format!("unknown document type {code}"),
                )
            })
    }

    /// Human-readable name.
    pub fn description(&self) -> &'static str {
        match self {
            Self::FacturaElectronica => "Factura Electrónica",
            Self::FacturaExenta => "Factura No Afecta o Exenta Electrónica",
            Self::BoletaElectronica => "Boleta Electrónica",
            Self::BoletaExenta => "Boleta Exenta Electrónica",
            Self::LiquidacionFactura => "Liquidación Factura Electrónica",
            Self::FacturaCompra => "Factura de Compra Electrónica",
            Self::GuiaDespacho => "Guía de Despacho Electrónica",
            Self::NotaDebito => "Nota de Débito Electrónica",
            Self::NotaCredito => "Nota de Crédito Electrónica",
            Self::FacturaExportacion => "Factura de Exportación Electrónica",
            Self::NotaDebitoExportacion => "Nota de Débito de Exportación Electrónica",
            Self::NotaCreditoExportacion => "Nota de Crédito de Exportación Electrónica",
        }
    }

    /// Receipts go through a separate submission channel.
    pub fn is_boleta(&self) -> bool {
        matches!(self, Self::BoletaElectronica | Self::BoletaExenta)
    }
}

impl std::fmt::Display for TipoDte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl TryFrom<u16> for TipoDte {
    type Error = SiiError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl From<TipoDte> for u16 {
    fn from(tipo: TipoDte) -> Self {
        tipo.code()
    }
}

impl std::str::FromStr for TipoDte {
    type Err = SiiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code: u16 = s.trim().parse().map_err(|_| {
            SiiError::new(
                ErrorKind::DocumentoInvalido,
                format!("document type must be numeric, got {s:?}"),
            )
        })?;
        Self::from_code(code)
    }
}
