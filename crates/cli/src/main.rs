#![forbid(unsafe_code)]

mod manifest;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trellis_api::ObjectAccessor;
use trellis_core::{ConditionType, ObjectKey};
use trellis_kubehub::KubeAccessor;
use trellis_reconcile::{Config, Controller, DrainReport, Phase};
use trellis_site::{references_of, Validators, CONFIG_MAP, KINDS};
use trellis_store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "trellisctl", version, about = "Trellis site controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (run: restrict reconciliation; simulate/deps: default for manifests)
    #[arg(long = "ns", alias = "namespace", global = true, env = "TRELLIS_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context until Ctrl-C
    Run {
        #[arg(long = "workers")]
        workers: Option<usize>,
        #[arg(long = "requeue-secs")]
        requeue_secs: Option<u64>,
        /// First retry delay after a transient failure
        #[arg(long = "backoff-base-ms")]
        backoff_base_ms: Option<u64>,
        /// Ceiling for the doubling retry delay
        #[arg(long = "backoff-max-secs")]
        backoff_max_secs: Option<u64>,
    },
    /// Reconcile manifests in memory and print the resulting states
    Simulate {
        /// Multi-document YAML file
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Requeue rounds to play after the first pass
        #[arg(long = "rounds", default_value_t = 3)]
        rounds: usize,
    },
    /// Print the objects that depend on one object from a manifest file
    Deps {
        #[arg(short = 'f', long = "file")]
        file: String,
        kind: String,
        name: String,
    },
    /// List kinds and their reference fields in resolution order
    Kinds,
}

fn init_tracing() {
    let env = std::env::var("TRELLIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TRELLIS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TRELLIS_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Serialize)]
struct StateRow {
    kind: String,
    namespace: Option<String>,
    name: String,
    phase: Phase,
    ready: String,
    reason: String,
    message: String,
}

#[derive(Serialize)]
struct KindRow {
    kind: &'static str,
    api_version: String,
    namespaced: bool,
    references: Vec<RefRow>,
}

#[derive(Serialize)]
struct RefRow {
    field: &'static str,
    path: &'static str,
    targets: Vec<&'static str>,
    default: Option<&'static str>,
}

fn load_store(file: &str, default_ns: &str) -> Result<Arc<MemoryStore>> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let store = Arc::new(MemoryStore::new());
    for o in manifest::parse(&text, default_ns)? {
        store.put(o);
    }
    Ok(store)
}

/// Command-line flags override environment settings.
fn run_config(
    mut cfg: Config,
    workers: Option<usize>,
    requeue_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_secs: Option<u64>,
    namespace: Option<String>,
) -> Config {
    if let Some(w) = workers.filter(|w| *w > 0) { cfg.workers = w; }
    if let Some(s) = requeue_secs { cfg.requeue_delay = Duration::from_secs(s); }
    if let Some(ms) = backoff_base_ms { cfg.backoff_base = Duration::from_millis(ms); }
    if let Some(s) = backoff_max_secs { cfg.backoff_max = Duration::from_secs(s); }
    if namespace.is_some() { cfg.namespace = namespace; }
    cfg
}

async fn states(store: &MemoryStore) -> Result<Vec<StateRow>> {
    let mut rows = Vec::new();
    for k in KINDS {
        for o in store.list(k.kind, None, None).await? {
            let ready = o.status.conditions.get(ConditionType::Ready);
            rows.push(StateRow {
                phase: Phase::of(&o),
                ready: ready.map(|c| format!("{:?}", c.status)).unwrap_or_else(|| "-".into()),
                reason: ready.map(|c| c.reason.clone()).unwrap_or_default(),
                message: ready.map(|c| c.message.clone()).unwrap_or_default(),
                kind: o.kind,
                namespace: o.namespace,
                name: o.name,
            });
        }
    }
    Ok(rows)
}

async fn simulate(controller: &Controller, rounds: usize) -> Result<DrainReport> {
    controller.seed().await?;
    let mut report = controller.drain(10_000).await;
    for round in 0..rounds {
        if report.waiting.is_empty() || report.exhausted {
            break;
        }
        info!(round = round + 1, waiting = report.waiting.len(), "replaying requeues");
        for (key, _) in &report.waiting {
            controller.enqueue(key.clone());
        }
        report = controller.drain(10_000).await;
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let default_ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());

    match cli.command {
        Commands::Run { workers, requeue_secs, backoff_base_ms, backoff_max_secs } => {
            let cfg = run_config(Config::from_env(), workers, requeue_secs, backoff_base_ms, backoff_max_secs, cli.namespace.clone());
            let kinds = KINDS.into_iter().chain(std::iter::once(CONFIG_MAP));
            let accessor = KubeAccessor::connect(kinds).await?.with_namespace(cfg.namespace.clone());
            let cancel = CancellationToken::new();
            let controller = trellis_site::controller_builder(Arc::new(accessor), cfg, &Validators::default())
                .cancel_token(cancel.clone())
                .build()?;
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; shutting down");
                }
                cancel.cancel();
            });
            controller.run().await?;
        }
        Commands::Simulate { file, rounds } => {
            let store = load_store(&file, &default_ns)?;
            let controller = trellis_site::controller(store.clone(), Config::from_env())?;
            let report = simulate(&controller, rounds).await?;
            let rows = states(&store).await?;
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        let id = match &r.namespace { Some(ns) => format!("{}/{}", ns, r.name), None => r.name.clone() };
                        println!("{:<20} {:<28} {:<13} {:<8} {:<16} {}", r.kind, id, format!("{:?}", r.phase), r.ready, r.reason, r.message);
                    }
                    println!("steps={} waiting={} failed={}", report.steps, report.waiting.len(), report.failed.len());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "objects": rows, "report": report }))?),
            }
        }
        Commands::Deps { file, kind, name } => {
            let store = load_store(&file, &default_ns)?;
            let controller = trellis_site::controller(store.clone(), Config::default())?;
            let info = trellis_site::kind_info(&kind).ok_or_else(|| anyhow::anyhow!("unknown kind {}", kind))?;
            let ns = info.namespaced.then_some(default_ns.as_str());
            let object = store.get(&kind, ns, &name).await?;
            let deps: Vec<ObjectKey> = controller.indexer().invalidate(&object).await?;
            match cli.output {
                Output::Human => {
                    if deps.is_empty() { println!("no dependents"); }
                    for k in &deps { println!("{}", k); }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&deps)?),
            }
        }
        Commands::Kinds => {
            let rows: Vec<KindRow> = KINDS
                .iter()
                .map(|k| KindRow {
                    kind: k.kind,
                    api_version: k.api_version(),
                    namespaced: k.namespaced,
                    references: references_of(k.kind)
                        .iter()
                        .map(|f| RefRow {
                            field: f.name,
                            path: f.path,
                            targets: f.target.variants().map(|v| v.kind).collect(),
                            default: f.default.map(|d| d.name),
                        })
                        .collect(),
                })
                .collect();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.api_version, r.kind, scope);
                        for f in &r.references {
                            let default = f.default.map(|d| format!(" (default {:?})", d)).unwrap_or_default();
                            println!("    {} -> {}{}", f.path, f.targets.join(" | "), default);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::parse_from(["trellisctl", "--ns", "site", "run", "--workers", "2", "--backoff-base-ms", "50", "--backoff-max-secs", "9"]);
        let Commands::Run { workers, requeue_secs, backoff_base_ms, backoff_max_secs } = cli.command else {
            panic!("expected run");
        };
        let cfg = run_config(Config::default(), workers, requeue_secs, backoff_base_ms, backoff_max_secs, cli.namespace);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.requeue_delay, Config::default().requeue_delay);
        assert_eq!(cfg.backoff_base, Duration::from_millis(50));
        assert_eq!(cfg.backoff_max, Duration::from_secs(9));
        assert_eq!(cfg.namespace.as_deref(), Some("site"));
    }
}
