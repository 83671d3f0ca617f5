use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kwatch_core::{
    scopes_for, Action, EngineConfig, KindCatalog, KindDescriptor, ResourceObject, ResourceVersion, Severity,
    StateSnapshot, Store, WatchTarget,
};
use kwatch_engine::WatchEngine;
use kwatch_kubehub::{watch_url, DiscoveryCatalog, Origin, StaticCatalog, WsConnector};
use kwatch_store::MemStore;
use metrics::counter;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kwatchctl", version, about = "kwatch CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Kind name as served by the cluster, e.g. "Pod" or "Deployment"
    kind: String,
    /// Namespace to watch; repeat for several. Omit (or pass "*") for all namespaces
    #[arg(long = "ns")]
    namespaces: Vec<String>,
    /// Resource version to resume from
    #[arg(long = "from-version", default_value = "0")]
    from_version: String,
    /// API base path, e.g. "api/v1" or "apis/apps/v1"; skips discovery together with --plural
    #[arg(long = "base-path", requires = "plural")]
    base_path: Option<String>,
    /// Plural resource name, e.g. "pods"
    #[arg(long = "plural", requires = "base_path")]
    plural: Option<String>,
    /// Host (and port) serving the watch proxy
    #[arg(long = "host", env = "KWATCH_HOST")]
    host: String,
    /// Use wss instead of ws
    #[arg(long = "secure")]
    secure: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List watchable kinds discovered on the current cluster
    Kinds,
    /// Print the watch URL for each namespace target
    Url(TargetArgs),
    /// Watch a kind and print every dispatched change until Ctrl-C
    Watch {
        #[command(flatten)]
        target: TargetArgs,
        /// Aggregation tick in milliseconds (default: KWATCH_TICK_MS or 1000)
        #[arg(long = "interval-ms")]
        interval_ms: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("KWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Explicit `--base-path/--plural` wins; otherwise ask the cluster.
async fn catalog_for(args: &TargetArgs) -> Result<StaticCatalog> {
    if let (Some(base_path), Some(plural)) = (&args.base_path, &args.plural) {
        return Ok(StaticCatalog::new([KindDescriptor {
            kind: args.kind.clone(),
            base_path: base_path.trim_matches('/').to_string(),
            plural: plural.clone(),
        }]));
    }
    DiscoveryCatalog::discover().await.context("kind discovery (pass --base-path and --plural to skip)")
}

fn origin(args: &TargetArgs) -> Origin { Origin { host: args.host.clone(), secure: args.secure } }

/// MemStore that echoes each dispatched action to stdout.
struct PrintingStore {
    inner: MemStore,
    output: Output,
}

impl Store for PrintingStore {
    fn dispatch(&self, action: Action) {
        counter!("cli_actions_printed_total", 1u64);
        println!("{}", render_action(&action, self.output));
        self.inner.dispatch(action);
    }

    fn get_state(&self) -> Arc<StateSnapshot> { self.inner.get_state() }
}

fn object_key(o: &ResourceObject) -> String {
    match &o.namespace {
        Some(ns) => format!("{}/{}", ns, o.name),
        None => o.name.clone(),
    }
}

fn render_action(action: &Action, output: Output) -> String {
    match output {
        Output::Human => match action {
            Action::PutResource { object, is_new: true } => format!("+ {} {}", object.kind, object_key(object)),
            Action::PutResource { object, is_new: false } => format!("~ {} {}", object.kind, object_key(object)),
            Action::RemoveResource { object } => format!("- {} {}", object.kind, object_key(object)),
            Action::ReceiveEvents { envelope, .. } => {
                let raw = &envelope.object.raw;
                let field = |k: &str| raw.get(k).and_then(|v| v.as_str()).unwrap_or("");
                format!("! {} {}: {} {}", envelope.event_type, object_key(&envelope.object), field("reason"), field("message"))
            }
            Action::ReportError { severity, message, .. } => {
                let level = match severity {
                    Severity::Error => "error",
                    Severity::Warning => "warning",
                    Severity::Info => "info",
                };
                format!("{}: {}", level, message)
            }
        },
        Output::Json => {
            let v = match action {
                Action::PutResource { object, is_new } => {
                    serde_json::json!({ "action": "put", "isNew": is_new, "object": object.raw })
                }
                Action::RemoveResource { object } => serde_json::json!({ "action": "remove", "object": object.raw }),
                Action::ReceiveEvents { resources, envelope } => serde_json::json!({
                    "action": "event",
                    "type": envelope.event_type.as_str(),
                    "object": envelope.object.raw,
                    "epoch": resources.epoch,
                }),
                Action::ReportError { error, severity, message } => serde_json::json!({
                    "action": "error",
                    "severity": severity,
                    "message": message,
                    "error": error,
                }),
            };
            v.to_string()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds => {
            info!("kinds invoked");
            let catalog = DiscoveryCatalog::discover().await?;
            let kinds = catalog.kinds();
            match cli.output {
                Output::Human => {
                    println!("{:<28} {:<36} PLURAL", "KIND", "BASE PATH");
                    for k in kinds {
                        println!("{:<28} {:<36} {}", k.kind, k.base_path, k.plural);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Url(args) => {
            info!(kind = %args.kind, ns = ?args.namespaces, "url invoked");
            let catalog = catalog_for(&args).await?;
            let Some(kind) = catalog.lookup(&args.kind) else { bail!("unknown kind {}", args.kind) };
            let origin = origin(&args);
            let mut urls = Vec::new();
            for namespace in scopes_for(&args.namespaces) {
                let target = WatchTarget {
                    kind: kind.clone(),
                    namespace,
                    from_version: ResourceVersion::from(args.from_version.as_str()),
                };
                urls.push(watch_url(&origin, &target)?.to_string());
            }
            match cli.output {
                Output::Human => urls.iter().for_each(|u| println!("{}", u)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&urls)?),
            }
        }
        Commands::Watch { target: args, interval_ms } => {
            info!(kind = %args.kind, ns = ?args.namespaces, rv = %args.from_version, "watch invoked");
            let catalog = catalog_for(&args).await?;
            let config = EngineConfig::from_env();
            let store = Arc::new(PrintingStore { inner: MemStore::default(), output: cli.output });
            let mut engine = WatchEngine::new(
                origin(&args),
                Arc::new(catalog),
                store.clone(),
                Arc::new(WsConnector::new()),
                config,
            );
            engine.start(
                &args.kind,
                &args.namespaces,
                args.from_version.as_str(),
                interval_ms.map(Duration::from_millis),
            );

            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C; stopping");
            } else {
                info!("Ctrl-C received; shutting down watch");
            }
            engine.stop();
            let snap = store.get_state();
            let errors = store.inner.errors();
            if !errors.is_empty() {
                warn!(errors = errors.len(), "watch ended with reported errors");
            }
            info!(resources = snap.resources.len(), events = store.inner.events().len(), "watch ended");
        }
    }

    Ok(())
}
