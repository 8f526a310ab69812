//! # Remote CLI — submit envelopes and query the authority.
//!
//! ```bash
//! sii submit dte_33_1.xml dte_33_2.xml --wait
//! sii submit EnvioDTE_76192083_20240301100000.xml
//! sii status 0211379914 --wait --interval 30
//! sii query --tipo 33 --folio 12 --receptor 60803000-K --fecha 2024-03-01 --monto 11900
//! ```
//!
//! Interrupting with Ctrl-C cancels the in-flight call and any polling.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::Args;
use sii_client::{CallContext, DocumentQuery, SiiClient, SiiConfig};
use sii_core::{Rut, SubmissionStatus, TipoDte};

use crate::{parse_tipo, read_xml};

/// Polling options shared by `submit` and `status`.
#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Poll until the authority reaches a final state.
    #[arg(long)]
    pub wait: bool,

    /// Seconds between polls.
    #[arg(long, default_value_t = 30)]
    pub interval: u64,

    /// Give up after this many seconds.
    #[arg(long)]
    pub deadline: Option<u64>,
}

/// Arguments of `sii submit`.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Signed DTE files, or a single signed EnvioDTE.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Arguments of `sii status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Tracking id returned on upload.
    pub track_id: String,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Arguments of `sii query`.
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Document type code.
    #[arg(long, value_parser = parse_tipo)]
    pub tipo: TipoDte,

    /// Folio.
    #[arg(long)]
    pub folio: u64,

    /// Issuer; the configured company when absent.
    #[arg(long)]
    pub emisor: Option<Rut>,

    /// Receiver.
    #[arg(long)]
    pub receptor: Rut,

    /// Issue date, `YYYY-MM-DD`.
    #[arg(long)]
    pub fecha: NaiveDate,

    /// Document total.
    #[arg(long)]
    pub monto: u64,
}

/// Execute `sii submit`.
pub async fn run_submit(args: &SubmitArgs, config: SiiConfig) -> Result<u8> {
    let documents = args
        .files
        .iter()
        .map(|path| read_xml(path))
        .collect::<Result<Vec<_>>>()?;

    let client = SiiClient::connect(config).await?;
    let ctx = call_context(&args.wait);
    let submissions = client.submissions();

    let status = match documents.as_slice() {
        [single] if single.root().local_name() == "EnvioDTE" => {
            let file_name = args.files[0]
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("EnvioDTE.xml")
                .to_string();
            submissions.submit_envelope(&ctx, single, file_name).await?
        }
        _ => {
            if let Some(pos) = documents
                .iter()
                .position(|d| d.root().local_name() != "DTE")
            {
                bail!(
                    "{} is neither a DTE nor a lone EnvioDTE",
                    args.files[pos].display()
                );
            }
            submissions.submit(&ctx, &documents).await?
        }
    };
    println!("  track id: {}", status.track_id);

    let status = if args.wait.wait {
        submissions
            .await_final(&ctx, &status.track_id, Duration::from_secs(args.wait.interval))
            .await?
    } else {
        status
    };
    report(&status)
}

/// Execute `sii status`.
pub async fn run_status(args: &StatusArgs, config: SiiConfig) -> Result<u8> {
    let client = SiiClient::connect(config).await?;
    let ctx = call_context(&args.wait);
    let submissions = client.submissions();
    let status = if args.wait.wait {
        submissions
            .await_final(&ctx, &args.track_id, Duration::from_secs(args.wait.interval))
            .await?
    } else {
        submissions.poll_status(&ctx, &args.track_id).await?
    };
    report(&status)
}

/// Execute `sii query`.
pub async fn run_query(args: &QueryArgs, config: SiiConfig) -> Result<u8> {
    let emisor = match (&args.emisor, &config.rut_empresa) {
        (Some(rut), _) | (None, Some(rut)) => rut.clone(),
        (None, None) => bail!("--emisor is required when no company RUT is configured"),
    };
    let query = DocumentQuery {
        tipo: args.tipo,
        folio: args.folio,
        rut_emisor: emisor,
        rut_receptor: args.receptor.clone(),
        fecha_emision: args.fecha,
        monto_total: args.monto,
    };
    let client = SiiClient::connect(config).await?;
    let status = client
        .submissions()
        .query_document(&CallContext::new(), &query)
        .await?;
    report(&status)
}

/// Print `status`; exit 0 when accepted or still pending, 2 when refused.
fn report(status: &SubmissionStatus) -> Result<u8> {
    crate::print_json(status)?;
    if let Some(err) = status.error() {
        tracing::error!(estado = %status.estado, "{err}");
        return Ok(2);
    }
    Ok(0)
}

fn call_context(wait: &WaitArgs) -> CallContext {
    let mut ctx = CallContext::new();
    if let Some(secs) = wait.deadline {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted");
            interrupt.cancel();
        }
    });
    ctx
}
