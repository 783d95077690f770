//! # SmartFolder Agent
//!
//! Background agent that watches folders and removable devices and sends
//! every new or changed file to a remote multi-engine scanning service.
//!
//! - `smartfolder-agent run` watches the configured roots until interrupted.
//! - `smartfolder-agent scan <path>` scans a file or directory once, prints
//!   the verdicts and exits with status 2 when anything was flagged.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use smartfolder_config::{AgentConfig, CONFIG_PATH_ENV, ConfigLoad, ConfigLoader};
use smartfolder_core::{
    InProcEventBus, MetascanClient, ObserverSet, PipelineEvent, PipelineObserver,
    RecordingObserver, Resolution, ScanPipeline, ScanRuntime, SessionStatus, TracingObserver,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "smartfolder-agent")]
#[command(about = "Watch folders and devices and scan new files with a remote scanning service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct CommonArgs {
    /// Configuration file, TOML or JSON (overrides SMARTFOLDER_CONFIG_PATH)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// API key for the scanning service (overrides config and SMARTFOLDER_API_KEY)
    #[arg(long, global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the file scanning endpoint (overrides config)
    #[arg(long, global = true)]
    service_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch configured directories and devices until interrupted (default)
    Run(RunArgs),
    /// Scan a file or directory once and exit
    Scan(ScanArgs),
}

#[derive(ClapArgs, Debug, Default)]
struct RunArgs {
    /// Extra directory to watch, in addition to the configured roots
    #[arg(short, long = "watch")]
    watch: Vec<PathBuf>,

    /// Do not poll for removable devices
    #[arg(long)]
    no_devices: bool,
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    /// File or directory to scan
    path: PathBuf,

    /// Rescan even when the file has not changed
    #[arg(short, long)]
    force: bool,

    /// What to do with flagged files once the scan finishes
    #[arg(long, value_enum)]
    on_infected: Option<InfectedAction>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum InfectedAction {
    /// Remove flagged files from disk
    Delete,
    /// Keep flagged files
    Ignore,
}

impl From<InfectedAction> for Resolution {
    fn from(action: InfectedAction) -> Self {
        match action {
            InfectedAction::Delete => Resolution::Delete,
            InfectedAction::Ignore => Resolution::Ignore,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli.common)?;

    match cli.command {
        Some(Command::Scan(args)) => run_scan(config, args).await,
        Some(Command::Run(args)) => run_agent(config, args).await,
        None => run_agent(config, RunArgs::default()).await,
    }
}

fn load_config(args: &CommonArgs) -> anyhow::Result<AgentConfig> {
    let loader = match args.config.clone() {
        Some(path) => ConfigLoader::new().with_env(move |key| {
            if key == CONFIG_PATH_ENV {
                Some(path.display().to_string())
            } else {
                std::env::var(key).ok()
            }
        }),
        None => ConfigLoader::new(),
    };

    let ConfigLoad {
        mut config,
        source,
        env_file_loaded,
        api_key_from_env,
    } = loader.load().context("failed to load configuration")?;

    if env_file_loaded {
        info!("loaded .env file");
    }
    info!(source = %source, api_key_from_env, "configuration loaded");

    if let Some(key) = args.api_key.as_ref() {
        config.api_key = key.trim().to_string();
    }
    if let Some(url) = args.service_url.as_ref() {
        config.pipeline.service_base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_runtime(
    config: &AgentConfig,
    devices: Vec<PathBuf>,
    observers: ObserverSet,
) -> anyhow::Result<ScanRuntime> {
    ScanRuntime::builder(config.pipeline.clone())
        .credential(config.api_key.clone())
        .observer(Arc::new(observers))
        .devices(devices)
        .build()
        .context("failed to assemble scan runtime")
}

async fn run_agent(config: AgentConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    if !config.has_api_key() {
        warn!("no API key configured; files will queue until one is provided");
    }

    let devices = if args.no_devices {
        Vec::new()
    } else {
        config.active_device_roots()
    };
    let observers = ObserverSet::new().with(Arc::new(TracingObserver));
    let runtime = build_runtime(&config, devices, observers)?;
    runtime.start().await?;

    let mut watched = 0usize;
    for root in config.roots.iter().chain(args.watch.iter()) {
        if runtime.register_directory(root).await {
            watched += 1;
        } else {
            warn!(path = %root.display(), "not a directory or already watched; skipping");
        }
    }
    info!(roots = watched, "agent running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    runtime.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

async fn run_scan(config: AgentConfig, args: ScanArgs) -> anyhow::Result<ExitCode> {
    if !config.has_api_key() {
        bail!("no API key configured; set SMARTFOLDER_API_KEY or pass --api-key");
    }

    let bus = Arc::new(InProcEventBus::new(config.pipeline.event_channel_capacity));
    let recorder = Arc::new(RecordingObserver::new());
    let observers = ObserverSet::new()
        .with(Arc::new(TracingObserver))
        .with(Arc::clone(&bus) as Arc<dyn PipelineObserver>)
        .with(Arc::clone(&recorder) as Arc<dyn PipelineObserver>);
    let mut events = bus.subscribe();

    let runtime = build_runtime(&config, Vec::new(), observers)?;
    runtime.start().await?;

    let queued = runtime
        .scan_now(&args.path, args.force)
        .await
        .with_context(|| format!("cannot scan {}", args.path.display()))?;
    if queued == 0 {
        println!("nothing to scan under {}", args.path.display());
        runtime.shutdown().await;
        return Ok(ExitCode::SUCCESS);
    }
    info!(queued, path = %args.path.display(), "scan started");

    let outcome = tokio::select! {
        _ = runtime.wait_until_idle(Duration::from_millis(200)) => Ok(()),
        _ = credential_rejected(&mut events) => Err(anyhow::anyhow!("the scanning service rejected the API key")),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            Err(anyhow::anyhow!("scan interrupted"))
        }
    };
    runtime.shutdown().await;
    outcome?;

    let flagged = report(&recorder);
    resolve_flagged(runtime.pipeline(), &recorder, args.on_infected).await;
    Ok(if flagged > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

async fn credential_rejected(events: &mut broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(PipelineEvent::CredentialInvalid) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Print one line per finished file. Returns how many were flagged.
fn report(recorder: &RecordingObserver) -> usize {
    let mut flagged = 0usize;
    for event in recorder.events() {
        if let PipelineEvent::SessionStatusChanged { file, status, .. } = event {
            match status {
                SessionStatus::Clean | SessionStatus::UnableToUpload => {
                    println!("{status}\t{}", file.display());
                }
                SessionStatus::Infected => {
                    flagged += 1;
                    println!("{status}\t{}", file.display());
                }
                _ => {}
            }
        }
    }

    flagged
}

async fn resolve_flagged(
    pipeline: &ScanPipeline,
    recorder: &RecordingObserver,
    action: Option<InfectedAction>,
) {
    for event in recorder.events() {
        let PipelineEvent::VirusDetected { session } = event else {
            continue;
        };
        if let Some(remote_id) = session.remote_id.as_ref() {
            println!("report\t{}", MetascanClient::result_url(remote_id));
        }
        let Some(action) = action else {
            continue;
        };
        match pipeline.resolve_infected(&session, action.into()).await {
            Ok(done) => println!("{}\t{}", done.label(), session.file.display()),
            Err(err) => warn!(path = %session.file.display(), error = %err, "could not resolve flagged file"),
        }
    }
}
