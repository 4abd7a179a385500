//! permbot - declarative RBAC for Kubernetes projects

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tracing::{error, info, warn};

use permbot::agent::{Agent, AgentConfig};
use permbot::client::KubeRbacClient;
use permbot::config::PolicyConfig;
use permbot::health::serve_health;
use permbot::notify::SlackNotifier;
use permbot::oneshot::{self, ApplyOptions, RenderOptions};
use permbot::source::{ConfigMapSource, PolicySource};
use permbot::telemetry::{init_telemetry, TelemetryConfig};
use permbot::{DEFAULT_CONFIGMAP, DEFAULT_OWNER};

/// permbot - compile project/role policy into Kubernetes RBAC
#[derive(Parser, Debug)]
#[command(name = "permbot", version = permbot::version(), about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true, env = "DEBUG")]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true, env = "JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the RBAC objects for a policy file as YAML
    Render(RenderArgs),

    /// Apply the RBAC objects for a policy file to the current cluster once
    Apply(ApplyArgs),

    /// Watch the policy ConfigMap and keep RBAC objects in sync
    Run(RunArgs),
}

/// Options shared by `render` and `apply`
#[derive(Args, Debug)]
struct PolicyFileArgs {
    /// Path to the policy TOML file
    file: PathBuf,

    /// Only this namespace (must be a project in the policy)
    #[arg(long)]
    namespace: Option<String>,

    /// Include cluster-scoped objects
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    global: bool,

    /// Owner label value
    #[arg(long, default_value = DEFAULT_OWNER)]
    owner: String,

    /// Policy revision to stamp on objects
    #[arg(long = "ref", default_value = "")]
    rules_ref: String,
}

impl PolicyFileArgs {
    fn load(&self) -> anyhow::Result<(PolicyConfig, RenderOptions)> {
        let config = PolicyConfig::load_from_file(&self.file)?;
        let options = RenderOptions {
            namespace: self.namespace.clone(),
            global: self.global,
            rules_ref: self.rules_ref.clone(),
            owner: self.owner.clone(),
        };
        Ok((config, options))
    }
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    policy: PolicyFileArgs,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[command(flatten)]
    policy: PolicyFileArgs,

    /// Validate writes server-side without persisting them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Policy ConfigMap as namespace/name (bare name means namespace default)
    #[arg(short = 'f', long, env = "PERMBOT_CONFIGMAP", default_value = DEFAULT_CONFIGMAP)]
    configmap: String,

    /// Owner label value
    #[arg(long, env = "PERMBOT_OWNER", default_value = DEFAULT_OWNER)]
    owner: String,

    /// Slack incoming webhook for cycle notifications
    #[arg(long, env = "SLACK_WEBHOOK")]
    slack_webhook: Option<String>,

    /// Address for the index and health endpoint (e.g. 0.0.0.0:8080)
    #[arg(long, env = "HTTP_LISTEN")]
    http_listen: Option<SocketAddr>,

    /// Validate writes server-side without persisting them
    #[arg(long)]
    dry_run: bool,

    /// Seconds between full resyncs
    #[arg(long, default_value_t = 600)]
    resync_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        debug: cli.debug,
        json_logs: cli.json_logs,
        ..Default::default()
    })?;

    match cli.command {
        Commands::Render(args) => render(args),
        Commands::Apply(args) => apply(args).await,
        Commands::Run(args) => run_agent(args).await,
    }
}

fn render(args: RenderArgs) -> anyhow::Result<()> {
    let (config, options) = args.policy.load()?;
    print!("{}", oneshot::render(&config, &options)?);
    Ok(())
}

async fn apply(args: ApplyArgs) -> anyhow::Result<()> {
    let (config, render) = args.policy.load()?;
    let client = KubeRbacClient::new(Client::try_default().await?);

    let summary = oneshot::apply(
        &client,
        &config,
        &ApplyOptions {
            render,
            dry_run: args.dry_run,
        },
    )
    .await?;

    info!(
        applied = summary.objects.applied,
        failed = summary.objects.failed,
        skipped_namespaces = summary.namespaces_skipped.len(),
        failed_namespaces = summary.namespaces_failed.len(),
        "apply complete"
    );
    if summary.has_failures() {
        anyhow::bail!(
            "{} objects failed to apply, {} namespaces could not be checked",
            summary.objects.failed,
            summary.namespaces_failed.len()
        );
    }
    Ok(())
}

async fn run_agent(args: RunArgs) -> anyhow::Result<()> {
    info!(version = permbot::version(), owner = %args.owner, "starting permbot agent");
    let client = Client::try_default().await?;

    let source = ConfigMapSource::from_ref(client.clone(), &args.configmap);
    info!(source = %source.source_ref(), dry_run = args.dry_run, "watching policy source");

    if let Some(addr) = args.http_listen {
        let owner = args.owner.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_health(addr, &owner).await {
                error!(error = %e, "health server failed");
            }
        });
    }

    let agent = Agent::new(
        Arc::new(KubeRbacClient::new(client)),
        Arc::new(source),
        Arc::new(SlackNotifier::new(args.slack_webhook, args.owner.clone())),
        args.owner,
        AgentConfig {
            dry_run: args.dry_run,
            resync_interval: Duration::from_secs(args.resync_secs),
            ..Default::default()
        },
    );

    agent.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
