use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use koil_controller::{BackoffConfig, ControllerConfig, Manager};
use koil_core::prelude::*;
use koil_store::MemoryStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "koilctl", version, about = "Koil reconciliation controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StoreKind { Memory, Kube }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Circle and Square controllers until Ctrl-C
    Run(RunArgs),
    /// List the kinds this controller reconciles
    Kinds,
    /// Print CustomResourceDefinitions for the reconciled kinds
    Crds,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Backing store
    #[arg(long, value_enum, env = "KOIL_STORE", default_value_t = StoreKind::Memory)]
    store: StoreKind,

    /// Multi-document YAML to seed the memory store with
    #[arg(long, env = "KOIL_SEED")]
    seed: Option<PathBuf>,

    /// Kubeconfig context (kube store only)
    #[arg(long, env = "KOIL_KUBE_CONTEXT")]
    context: Option<String>,

    /// Workers per kind
    #[arg(long, env = "KOIL_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Per-kind worker override, e.g. "Circle=4"; repeatable
    #[arg(long = "kind-workers", value_parser = parse_kind_workers)]
    kind_workers: Vec<(String, usize)>,

    /// First retry delay after a failed reconcile, in milliseconds
    #[arg(long, env = "KOIL_BACKOFF_BASE_MS", default_value_t = 50)]
    backoff_base_ms: u64,

    /// Retry delay ceiling, in seconds
    #[arg(long, env = "KOIL_BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Relative tolerance for numeric status comparison (0 = exact). Changes
    /// smaller than this fraction are not written back
    #[arg(long, env = "KOIL_FLOAT_TOLERANCE", default_value_t = 0.0)]
    float_tolerance: f64,

    /// Stop after this long instead of waiting for Ctrl-C, e.g. "30s" or "2m"
    #[arg(long = "for", value_parser = parse_duration)]
    run_for: Option<Duration>,
}

impl RunArgs {
    fn controller_config(&self) -> Result<ControllerConfig> {
        let base = Duration::from_millis(self.backoff_base_ms);
        let max = Duration::from_secs(self.backoff_max_secs);
        if base.is_zero() {
            bail!("--backoff-base-ms must be positive");
        }
        if max < base {
            bail!("--backoff-max-secs ({max:?}) is below --backoff-base-ms ({base:?})");
        }
        Ok(ControllerConfig {
            workers: self.workers,
            backoff: BackoffConfig::new(base, max),
            float_tolerance: self.float_tolerance,
            ..Default::default()
        })
    }

    /// Later flags win over earlier ones for the same kind.
    fn workers_for(&self, kind: &ResourceKind) -> Option<usize> {
        self.kind_workers.iter().rev().find(|(k, _)| names_kind(k, kind)).map(|(_, n)| *n)
    }
}

fn names_kind(name: &str, kind: &ResourceKind) -> bool {
    name == kind.kind || name == kind.gvk_key()
}

fn parse_kind_workers(s: &str) -> Result<(String, usize), String> {
    let (kind, n) = s.split_once('=').ok_or_else(|| format!("expected KIND=N, got {s:?}"))?;
    let n: usize = n.trim().parse().map_err(|e| format!("invalid worker count in {s:?}: {e}"))?;
    if n == 0 {
        return Err(format!("worker count must be at least 1 in {s:?}"));
    }
    Ok((kind.trim().to_string(), n))
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let v: f64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "ms" => v / 1000.0,
        "" | "s" => v,
        "m" => v * 60.0,
        "h" => v * 3600.0,
        other => return Err(format!("unknown duration unit {other:?} (use ms, s, m or h)")),
    };
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

fn init_tracing() {
    let env = std::env::var("KOIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KOIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KOIL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args, cli.output).await,
        Commands::Kinds => {
            let kinds = koil_shapes::kinds();
            match cli.output {
                Output::Human => {
                    for k in &kinds {
                        println!("{}", k.gvk_key());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
            Ok(())
        }
        Commands::Crds => {
            let crds = koil_shapes::crds();
            match cli.output {
                Output::Human => {
                    let docs = crds.iter().map(serde_yaml::to_string).collect::<Result<Vec<_>, _>>()?;
                    print!("{}", docs.join("---\n"));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&crds)?),
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs, output: Output) -> Result<()> {
    if let Some(objects) = run_controller(args).await? {
        print_snapshot(&objects, output)?;
    }
    Ok(())
}

/// Runs until stopped; returns the final snapshot when the store is in memory.
async fn run_controller(args: RunArgs) -> Result<Option<Vec<ResourceObject>>> {
    let config = args.controller_config()?;
    let kinds = koil_shapes::kinds();
    for (name, _) in &args.kind_workers {
        if !kinds.iter().any(|k| names_kind(name, k)) {
            bail!("--kind-workers: {name} is not a reconciled kind");
        }
    }

    let (store, memory): (Arc<dyn ResourceStore>, Option<Arc<MemoryStore>>) = match args.store {
        StoreKind::Memory => {
            let mem = Arc::new(MemoryStore::new());
            if let Some(path) = &args.seed {
                let yaml = std::fs::read_to_string(path).with_context(|| format!("reading seed {}", path.display()))?;
                mem.load_manifests(&yaml).with_context(|| format!("loading seed {}", path.display()))?;
            }
            let shared: Arc<dyn ResourceStore> = mem.clone();
            (shared, Some(mem))
        }
        StoreKind::Kube => {
            if args.seed.is_some() {
                warn!("--seed only applies to the memory store; ignoring");
            }
            let kube = koil_kubehub::KubeStore::connect(args.context.as_deref(), &kinds)
                .await
                .context("connecting to Kubernetes")?;
            let shared: Arc<dyn ResourceStore> = Arc::new(kube);
            (shared, None)
        }
    };

    let mut manager = Manager::new(store, config)?;
    koil_shapes::register_all(&mut manager, |k| args.workers_for(k))?;
    info!(store = ?args.store, kinds = ?manager.kinds().iter().map(|k| k.gvk_key()).collect::<Vec<_>>(), "starting");

    let cancel = CancellationToken::new();
    tokio::spawn(stop_on_signal(cancel.clone(), args.run_for));
    manager.start(cancel).await?;
    Ok(memory.map(|mem| mem.snapshot()))
}

async fn stop_on_signal(cancel: CancellationToken, run_for: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let deadline = async {
        match run_for {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received; shutting down"),
        _ = deadline => info!(after = ?run_for, "run duration elapsed; shutting down"),
    }
    cancel.cancel();
}

fn print_snapshot(objects: &[ResourceObject], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<8} {:<11} {:<20} {:>4} {:>5}  STATUS", "KIND", "NAMESPACE", "NAME", "GEN", "RV");
            for o in objects {
                let ns = o.key.namespace.as_deref().unwrap_or("-");
                let status = o.status.as_ref().map_or_else(|| "-".to_string(), |s| s.to_string());
                println!(
                    "{:<8} {:<11} {:<20} {:>4} {:>5}  {}",
                    o.key.kind.kind, ns, o.key.name, o.generation, o.resource_version, status
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(objects)?),
    }
    Ok(())
}
