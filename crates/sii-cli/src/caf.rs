//! # CAF CLI — manage folio authorizations.
//!
//! ```bash
//! sii caf import FoliosSII76192083331.xml
//! sii caf list --tipo 33
//! sii caf availability --tipo 33
//! sii caf expire --tipo 33
//! sii caf vigencia --tipo 33
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use sii_caf::{CafManager, Vigencia};
use sii_client::SiiConfig;
use sii_core::TipoDte;

use crate::parse_tipo;

/// CAF subcommand arguments.
#[derive(Args, Debug)]
pub struct CafArgs {
    #[command(subcommand)]
    pub command: CafCommand,
}

/// Available CAF subcommands.
#[derive(Subcommand, Debug)]
pub enum CafCommand {
    /// Validate and store an authorization file.
    Import {
        /// CAF XML as downloaded from the authority.
        file: PathBuf,
    },
    /// List stored authorizations of one document type.
    List {
        /// Document type code.
        #[arg(long, value_parser = parse_tipo)]
        tipo: TipoDte,
    },
    /// Remaining folios across current authorizations. Exits 2 under the
    /// low-stock threshold.
    Availability {
        /// Document type code.
        #[arg(long, value_parser = parse_tipo)]
        tipo: TipoDte,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Mark expired authorizations as `VENCIDO`.
    Expire {
        /// Document type code.
        #[arg(long, value_parser = parse_tipo)]
        tipo: TipoDte,
    },
    /// Days to expiry and folio usage per authorization. Exits 2 when any
    /// current authorization is inside the expiry warning window.
    Vigencia {
        /// Document type code.
        #[arg(long, value_parser = parse_tipo)]
        tipo: TipoDte,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Delete a stored authorization.
    Remove {
        /// Authorization id as shown by `list`.
        id: String,
    },
}

/// Execute the caf subcommand.
pub async fn run_caf(args: &CafArgs, config: &SiiConfig) -> Result<u8> {
    let manager = sii_client::caf_manager(config)?;
    match &args.command {
        CafCommand::Import { file } => run_import(&manager, file).await,
        CafCommand::List { tipo } => run_list(&manager, *tipo).await,
        CafCommand::Availability { tipo, json } => run_availability(&manager, *tipo, *json).await,
        CafCommand::Expire { tipo } => {
            let expired = manager.expire_stale(*tipo).await?;
            for id in &expired {
                println!("  expired: {id}");
            }
            println!("Total: {} authorizations expired", expired.len());
            Ok(0)
        }
        CafCommand::Vigencia { tipo, json } => run_vigencia(&manager, *tipo, *json).await,
        CafCommand::Remove { id } => {
            if manager.remove(id).await? {
                println!("  removed: {id}");
                Ok(0)
            } else {
                println!("  not found: {id}");
                Ok(1)
            }
        }
    }
}

async fn run_import(manager: &CafManager, file: &Path) -> Result<u8> {
    let xml = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let caf = manager.import_xml(&xml).await?;
    println!("  id:          {}", caf.id);
    println!("  tipo:        {} ({})", caf.tipo.code(), caf.tipo);
    println!("  emisor:      {} {}", caf.rut_emisor, caf.razon_social);
    println!("  folios:      {}..={}", caf.folio_inicial, caf.folio_final);
    println!("  autorizado:  {}", caf.fecha_autorizacion);
    println!("  vence:       {}", caf.fecha_vencimiento.format("%Y-%m-%d"));
    Ok(0)
}

async fn run_list(manager: &CafManager, tipo: TipoDte) -> Result<u8> {
    let cafs = manager.list(tipo).await?;
    for caf in &cafs {
        println!(
            "  {:<32} {:<8} {:>8}..={:<8} last {:<8} available {:<8} expires {}",
            caf.id,
            caf.estado.as_str(),
            caf.folio_inicial,
            caf.folio_final,
            caf.folio_ultimo,
            caf.available_folios(),
            caf.fecha_vencimiento.format("%Y-%m-%d")
        );
    }
    println!();
    println!("Total: {} authorizations", cafs.len());
    Ok(0)
}

async fn run_availability(manager: &CafManager, tipo: TipoDte, json: bool) -> Result<u8> {
    let availability = manager.availability(tipo).await?;
    if json {
        crate::print_json(&availability)?;
    } else {
        println!("  tipo:      {} ({})", tipo.code(), tipo);
        println!("  available: {}", availability.available);
        println!("  cafs:      {}", availability.active_cafs);
        println!("  threshold: {}", manager.low_stock_threshold());
    }
    if availability.low_stock {
        tracing::warn!(
            tipo = tipo.code(),
            available = availability.available,
            "folio stock is low"
        );
        return Ok(2);
    }
    Ok(0)
}

async fn run_vigencia(manager: &CafManager, tipo: TipoDte, json: bool) -> Result<u8> {
    let report = manager.vigencia_report(tipo).await?;
    if json {
        crate::print_json(&report)?;
    } else {
        for entry in &report {
            println!(
                "  {:<32} {:<16} {:>5} days  available {:<8} used {}",
                entry.caf_id,
                format!("{:?}", entry.vigencia),
                entry.dias_restantes,
                entry.folios_disponibles,
                entry.folios_utilizados
            );
        }
        println!();
        println!("Warning window: {} days", manager.expiry_warning_days());
    }
    if report.iter().any(|e| e.vigencia == Vigencia::ProximoExpirar) {
        return Ok(2);
    }
    Ok(0)
}
