use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{
    AppQuery, AppRef, AppService, CreateRequest, DeleteRequest, ResourceRequest, RollbackRequest, ServerConfig, SyncRequest,
};
use keel_core::{Application, Claims, RefreshType, ResourceRef, Stage};
use keel_kubehub::{KubeAppStore, KubeEventRecorder, KubeLiveResources, KubeProjects};
use keel_rbac::Enforcer;
use keel_store::{ObjectStore, ProjectStore, WatchKind};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: access-controlled Application operations")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Control namespace
    #[arg(long = "namespace", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Comma-separated globs of additional Application namespaces
    #[arg(long = "app-namespaces", global = true, env = "KEEL_APP_NAMESPACES")]
    app_namespaces: Option<String>,

    /// CSV policy (`p`/`g` lines) layered over the built-in roles
    #[arg(long = "policy-file", global = true, env = "KEEL_POLICY_FILE")]
    policy_file: Option<std::path::PathBuf>,

    /// Role granted to every principal
    #[arg(long = "default-role", global = true, env = "KEEL_DEFAULT_ROLE")]
    default_role: Option<String>,

    /// Act as this subject
    #[arg(long = "as", global = true)]
    subject: Option<String>,

    /// Group claims of the acting principal (repeatable)
    #[arg(long = "group", global = true, action = ArgAction::Append)]
    groups: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Refresh { Normal, Hard }

#[derive(clap::Args, Debug, Clone, Default)]
struct Target {
    /// `name` or `namespace/name`
    name: String,
    /// Namespace of the Application
    #[arg(long = "app-namespace")]
    app_namespace: Option<String>,
    /// Expected project
    #[arg(long = "project")]
    project: Option<String>,
}

impl Target {
    fn app_ref(&self) -> AppRef {
        AppRef { name: self.name.clone(), app_namespace: self.app_namespace.clone(), project: self.project.clone() }
    }
}

#[derive(clap::Args, Debug, Clone, Default)]
struct Filters {
    /// Name glob
    #[arg(long = "name")]
    name: Option<String>,
    /// Project (repeatable)
    #[arg(long = "project", action = ArgAction::Append)]
    projects: Vec<String>,
    #[arg(long = "repo")]
    repo: Option<String>,
    /// Label selector, e.g. `env=prod,tier in (web,api)`
    #[arg(short = 'l', long = "selector")]
    selector: Option<String>,
    #[arg(long = "app-namespace")]
    app_namespace: Option<String>,
    /// Only objects at or above this version
    #[arg(long = "resource-version")]
    resource_version: Option<String>,
}

impl Filters {
    fn query(&self) -> AppQuery {
        AppQuery {
            name: self.name.clone(),
            projects: self.projects.clone(),
            repo: self.repo.clone(),
            selector: self.selector.clone(),
            resource_version: self.resource_version.clone(),
            app_namespace: self.app_namespace.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List visible Applications
    List {
        #[command(flatten)]
        filters: Filters,
    },
    /// Stream changes to visible Applications until Ctrl-C
    Watch {
        #[command(flatten)]
        filters: Filters,
    },
    /// Show one Application
    Get {
        #[command(flatten)]
        target: Target,
        #[arg(long = "refresh", value_enum)]
        refresh: Option<Refresh>,
    },
    /// Create an Application from a YAML or JSON file
    Create {
        #[arg(short = 'f', long = "file")]
        file: std::path::PathBuf,
        #[arg(long = "upsert", action = ArgAction::SetTrue)]
        upsert: bool,
        /// Skip repo/destination checks against the project
        #[arg(long = "skip-validation", action = ArgAction::SetTrue)]
        skip_validation: bool,
    },
    /// Patch an Application (`json` or `merge`)
    Patch {
        #[command(flatten)]
        target: Target,
        #[arg(long = "patch")]
        patch: String,
        #[arg(long = "type", default_value = "json")]
        patch_type: String,
    },
    /// Delete an Application
    Delete {
        #[command(flatten)]
        target: Target,
        #[arg(long = "cascade")]
        cascade: Option<bool>,
        /// foreground | background
        #[arg(long = "propagation-policy")]
        propagation_policy: Option<String>,
    },
    /// Request a sync
    Sync {
        #[command(flatten)]
        target: Target,
        #[arg(long = "revision", default_value = "")]
        revision: String,
        /// Multi-source revisions, paired with --source-position
        #[arg(long = "revisions", action = ArgAction::Append)]
        revisions: Vec<String>,
        #[arg(long = "source-position", action = ArgAction::Append)]
        source_positions: Vec<usize>,
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Roll back to a history entry
    Rollback {
        #[command(flatten)]
        target: Target,
        id: i64,
        #[arg(long = "source-index")]
        source_index: Option<usize>,
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Terminate the running operation
    Terminate {
        #[command(flatten)]
        target: Target,
    },
    /// Show the sync windows that apply to an Application
    Windows {
        #[command(flatten)]
        target: Target,
    },
    /// Show the cached resource tree
    Tree {
        #[command(flatten)]
        target: Target,
    },
    /// Run a resource action such as `restart`
    Action {
        #[command(flatten)]
        target: Target,
        /// `group/Kind/namespace/name` (empty group for core kinds)
        resource: String,
        action: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Environment config with flag overrides applied.
fn server_config(cli: &Cli) -> ServerConfig {
    let mut cfg = ServerConfig::from_env();
    if let Some(ns) = cli.namespace.as_deref().filter(|s| !s.trim().is_empty()) {
        cfg.namespace = ns.trim().to_string();
    }
    if let Some(list) = &cli.app_namespaces {
        cfg.app_namespaces = keel_api::config::split_list(list);
    }
    cfg
}

fn claims(cli: &Cli) -> Claims {
    let c = match cli.subject.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Claims::user(s),
        None => Claims::anonymous(),
    };
    c.with_groups(cli.groups.iter().cloned())
}

fn enforcer(cli: &Cli) -> Result<Enforcer> {
    let e = Enforcer::with_builtin()?;
    if let Some(path) = &cli.policy_file {
        let csv = std::fs::read_to_string(path).with_context(|| format!("reading policy file {}", path.display()))?;
        e.set_user_policy(&csv).with_context(|| format!("parsing policy file {}", path.display()))?;
    }
    if let Some(role) = &cli.default_role {
        e.set_default_role(role);
    }
    Ok(e)
}

fn parse_resource(s: &str) -> Result<ResourceRef> {
    match s.split('/').collect::<Vec<_>>().as_slice() {
        [group, kind, ns, name] => Ok(ResourceRef::new(group, kind, ns, name)),
        _ => anyhow::bail!("invalid resource {s:?} (expect group/Kind/namespace/name)"),
    }
}

fn stage_label(app: &Application) -> String {
    match app.stage() {
        Stage::Idle => "-".into(),
        Stage::Pending => "Pending".into(),
        Stage::Running => "Running".into(),
        Stage::Terminating => "Terminating".into(),
        Stage::Terminal(p) => format!("{p:?}"),
    }
}

fn or_dash(s: &str) -> &str { if s.is_empty() { "-" } else { s } }

fn print_apps(out: Output, apps: &[Application]) -> Result<()> {
    match out {
        Output::Human => {
            println!("{:<14} {:<28} {:<14} {:<10} {:<11} {}", "NAMESPACE", "NAME", "PROJECT", "SYNC", "HEALTH", "OPERATION");
            for a in apps {
                println!(
                    "{:<14} {:<28} {:<14} {:<10} {:<11} {}",
                    a.namespace(),
                    a.name(),
                    a.project(),
                    or_dash(&a.status.sync.status),
                    or_dash(&a.status.health.status),
                    stage_label(a)
                );
            }
            Ok(())
        }
        _ => print_value(out, &apps),
    }
}

fn print_value<T: Serialize>(out: Output, v: &T) -> Result<()> {
    match out {
        Output::Yaml => print!("{}", serde_yaml::to_string(v)?),
        _ => println!("{}", serde_json::to_string_pretty(v)?),
    }
    Ok(())
}

fn read_app(path: &std::path::Path) -> Result<Application> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

async fn build_service(cli: &Cli) -> Result<AppService> {
    let cfg = server_config(cli);
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    // Enabled app namespaces need a cluster-wide watch.
    let scope = if cfg.app_namespaces.is_empty() { Some(cfg.namespace.as_str()) } else { None };
    let store: Arc<dyn ObjectStore> = Arc::new(KubeAppStore::start(client.clone(), scope).await?);
    let projects: Arc<dyn ProjectStore> = Arc::new(KubeProjects::new(client.clone(), &cfg.namespace));
    let enforcer = Arc::new(enforcer(cli)?);
    info!(namespace = %cfg.namespace, app_namespaces = ?cfg.app_namespaces, "keelctl: service ready");
    Ok(AppService::builder(store, projects, enforcer)
        .config(cfg)
        .live(Arc::new(KubeLiveResources::new(client.clone())))
        .audit(Arc::new(KubeEventRecorder::new(client)))
        .build())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let svc = build_service(&cli).await?;
    let who = claims(&cli);
    let out = cli.output;

    match &cli.command {
        Commands::List { filters } => {
            let apps = svc.list(&who, &filters.query()).await?;
            print_apps(out, &apps)?;
        }
        Commands::Watch { filters } => {
            let mut stream = svc.watch(&who, &filters.query()).await?;
            loop {
                tokio::select! {
                    ev = stream.rx.recv() => match ev {
                        Some(ev) => match out {
                            Output::Human => {
                                let mark = match ev.kind { WatchKind::Added => "+", WatchKind::Modified => "~", WatchKind::Deleted => "-" };
                                println!("{mark} {} ({})", ev.app.key(), stage_label(&ev.app));
                            }
                            _ => println!("{}", serde_json::to_string(&ev)?),
                        },
                        None => {
                            warn!("watch stream closed");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping watch");
                        break;
                    }
                }
            }
            stream.cancel.cancel();
        }
        Commands::Get { target, refresh } => {
            let kind = refresh.map(|r| match r { Refresh::Normal => RefreshType::Normal, Refresh::Hard => RefreshType::Hard });
            let app = svc.get(&who, &target.app_ref(), kind).await?;
            match out {
                Output::Human => print_apps(out, std::slice::from_ref(&app))?,
                _ => print_value(out, &app)?,
            }
        }
        Commands::Create { file, upsert, skip_validation } => {
            let app = read_app(file)?;
            let created = svc.create(&who, CreateRequest { app, upsert: *upsert, validate: !skip_validation }).await?;
            println!("application '{}' created", created.key());
        }
        Commands::Patch { target, patch, patch_type } => {
            let app = svc.patch(&who, &target.app_ref(), patch, patch_type).await?;
            print_value(if out == Output::Human { Output::Yaml } else { out }, &app.spec)?;
        }
        Commands::Delete { target, cascade, propagation_policy } => {
            let req = DeleteRequest { app: target.app_ref(), cascade: *cascade, propagation_policy: propagation_policy.clone() };
            svc.delete(&who, req).await?;
            println!("application '{}' deleted", target.name);
        }
        Commands::Sync { target, revision, revisions, source_positions, prune, dry_run } => {
            let req = SyncRequest {
                app: target.app_ref(),
                revision: revision.clone(),
                revisions: revisions.clone(),
                source_positions: source_positions.clone(),
                prune: *prune,
                dry_run: *dry_run,
                ..Default::default()
            };
            let app = svc.sync(&who, req).await?;
            println!("sync requested for '{}'", app.key());
        }
        Commands::Rollback { target, id, source_index, prune } => {
            let req = RollbackRequest { app: target.app_ref(), id: *id, source_index: *source_index, prune: *prune, dry_run: false };
            let app = svc.rollback(&who, req).await?;
            println!("rollback to {id} requested for '{}'", app.key());
        }
        Commands::Terminate { target } => {
            let app = svc.terminate_operation(&who, &target.app_ref()).await?;
            println!("termination requested for '{}'", app.key());
        }
        Commands::Windows { target } => {
            let st = svc.sync_windows(&who, &target.app_ref()).await?;
            match out {
                Output::Human => {
                    println!("{:<6} {:<16} {:<9} {:<7} {}", "KIND", "SCHEDULE", "DURATION", "ACTIVE", "MANUAL");
                    for w in &st.assigned_windows {
                        let active = st.active_windows.contains(w);
                        println!("{:<6} {:<16} {:<9} {:<7} {}", w.kind, w.schedule, w.duration, active, w.manual_sync);
                    }
                    println!("manual sync allowed: {}", st.can_sync);
                }
                _ => print_value(out, &st)?,
            }
        }
        Commands::Tree { target } => {
            let tree = svc.resource_tree(&who, &target.app_ref()).await?;
            match out {
                Output::Human => {
                    for n in &tree.nodes {
                        let r = &n.resource;
                        println!("{}/{} {}/{}", or_dash(&r.group), r.kind, or_dash(&r.namespace), r.name);
                    }
                }
                _ => print_value(out, &tree)?,
            }
        }
        Commands::Action { target, resource, action } => {
            let req = ResourceRequest { app: target.app_ref(), resource: parse_resource(resource)? };
            svc.run_resource_action(&who, &req, action).await?;
            println!("action '{action}' ran on {resource}");
        }
    }
    Ok(())
}
