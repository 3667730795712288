use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_core::Status;
use keel_kubehub::KubeStore;
use keel_reconcile::{Callbacks, CancellationToken, ErrorPolicy, ManagerOptions};
use keel_store::{CascadePolicy, Store};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod batch;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Apply or delete batches of owned resource trees")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: manifest, then current context)
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Log filter directives, e.g. `info,keel_reconcile=debug`
    #[arg(long = "log", global = true, env = "KEEL_LOG", default_value = "info")]
    log: String,

    /// Serve reconcile metrics in Prometheus format on this address
    #[arg(long = "metrics-addr", global = true, env = "KEEL_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Cascade { Foreground, Background, Orphan }

impl From<Cascade> for CascadePolicy {
    fn from(c: Cascade) -> Self {
        match c {
            Cascade::Foreground => CascadePolicy::Foreground,
            Cascade::Background => CascadePolicy::Background,
            Cascade::Orphan => CascadePolicy::Orphan,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge every tree of the batch, parents before children
    Apply {
        /// Batch manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Delete every parent of the batch when anything fails
        #[arg(long = "purge-on-error", action = ArgAction::SetTrue)]
        purge_on_error: bool,
        /// Wait for each created/updated resource to report Ready
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Do not stamp parent owner references on children
        #[arg(long = "no-owners", action = ArgAction::SetTrue)]
        no_owners: bool,
    },
    /// Delete every tree of the batch, children before parents
    Delete {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        #[arg(long = "cascade", value_enum, default_value_t = Cascade::Background)]
        cascade: Cascade,
    },
}

/// Logs go to stderr; stdout carries one line per status.
fn init_tracing(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives).with_context(|| format!("invalid log filter {:?}", directives))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
    Ok(())
}

/// Exposes `reconcile_outcomes`, `reconcile_apply_ms`, `gc_deleted` and the
/// store counters for the lifetime of the batch.
fn serve_metrics(addr: Option<SocketAddr>) -> Result<Option<SocketAddr>> {
    let Some(addr) = addr else { return Ok(None) };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("serving metrics on {}", addr))?;
    Ok(Some(addr))
}

/// Post hook that prints one line per status as it happens.
fn printer(output: Output) -> Callbacks {
    Callbacks::default().post(move |hook, err| {
        let Some(status) = hook.status() else { return Ok(()) };
        match output {
            Output::Human => println!("{}", render(status, err.map(|e| e.to_string()).as_deref())),
            Output::Json => {
                let line = serde_json::json!({
                    "outcome": status.outcome,
                    "kind": status.resource.types.key(),
                    "name": status.resource.name(),
                    "error": err.map(|e| e.to_string()),
                });
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Ok(())
    })
}

fn render(status: &Status, err: Option<&str>) -> String {
    let line = format!("{:<8} {}/{}", status.outcome.as_str(), status.resource.types.kind, status.resource.name());
    match err {
        Some(e) => format!("{}  ({})", line, e),
        None => line,
    }
}

fn summary(statuses: &[Status]) -> String {
    let mut counts = std::collections::BTreeMap::<&str, usize>::new();
    for s in statuses {
        *counts.entry(s.outcome.as_str()).or_default() += 1;
    }
    counts.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(" ")
}

/// Cancel the batch token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling batch");
            child.cancel();
        }
    });
    token
}

async fn load(file: &PathBuf, ns_flag: Option<&str>) -> Result<(batch::BatchFile, Arc<dyn Store>)> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let manifest = batch::parse(&text)?;
    let ns = ns_flag.or(manifest.namespace.as_deref());
    let store = KubeStore::try_default(ns).await?;
    Ok((manifest, Arc::new(store) as Arc<dyn Store>))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    if let Some(addr) = serve_metrics(cli.metrics_addr)? {
        info!(%addr, "metrics exporter listening");
    }
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Apply { file, dry_run, purge_on_error, wait, no_owners } => {
            let (manifest, store) = load(&file, cli.namespace.as_deref()).await?;
            info!(file = %file.display(), ns = %store.namespace(), trees = manifest.trees.len(), dry_run, "apply invoked");
            let mut mgr = batch::build(&manifest, store)?;
            let opts = ManagerOptions {
                dry_run,
                error_policy: if purge_on_error { ErrorPolicy::PurgeOnError } else { ErrorPolicy::NothingOnError },
                propagate_owners: !no_owners,
                wait_for_apply: wait,
                callbacks: printer(cli.output),
                ..Default::default()
            };
            let statuses = mgr.apply(&cancel, &opts).await.context("apply failed")?;
            info!(summary = %summary(&statuses), "apply finished");
        }
        Commands::Delete { file, dry_run, cascade } => {
            let (manifest, store) = load(&file, cli.namespace.as_deref()).await?;
            info!(file = %file.display(), ns = %store.namespace(), cascade = ?cascade, dry_run, "delete invoked");
            let mut mgr = batch::build(&manifest, store)?;
            let opts = ManagerOptions {
                dry_run,
                cascade: cascade.into(),
                callbacks: printer(cli.output),
                ..Default::default()
            };
            let statuses = mgr.delete(&cancel, &opts).await.context("delete failed")?;
            info!(summary = %summary(&statuses), "delete finished");
        }
    }

    Ok(())
}
