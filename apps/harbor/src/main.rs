use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use harbor_client_core::config::{ClientConfig, parse_relay_url};
use harbor_client_core::connection::{ConnectReason, DeviceId};
use harbor_client_core::load::Tier;
use harbor_client_core::metrics;
use harbor_client_core::relay::mock::{ScriptedRelay, ScriptedResponse};
use harbor_client_core::relay::websocket::{WebSocketRelay, WebSocketRelayConfig};
use harbor_client_core::runtime::WorkspaceRuntime;
use harbor_client_core::telemetry::{self, LogConfig, LogLevel};
use harbor_client_core::workspace::WorkspaceEvent;
use serde_json::json;
use state_bus::BusError;
use tracing::{debug, warn};

const DEMO_DEVICE: &str = "demo-desktop";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("harbor: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.client_config()?;
    let log_config = cli.logging.to_config(&config);
    telemetry::init(&log_config).context("logging setup failed")?;
    debug!(
        log_level = ?log_config.level,
        log_file = ?log_config.file,
        filter = log_config.directives(),
        "logging configured"
    );

    let device = match (&cli.device, cli.demo) {
        (Some(device), _) => DeviceId::new(device.clone()),
        (None, true) => DeviceId::new(DEMO_DEVICE),
        (None, false) => return Err(anyhow!("--device is required unless --demo is set")),
    };

    let runtime = if cli.demo {
        WorkspaceRuntime::start(config, Arc::new(demo_relay()))
    } else {
        let relay = WebSocketRelay::new(WebSocketRelayConfig::from_client_config(&config));
        WorkspaceRuntime::start(config, Arc::new(relay))
    };

    let outcome = match cli.command.unwrap_or(Command::Watch(WatchArgs::default())) {
        Command::Watch(args) => watch(&runtime, device, args).await,
        Command::Browse(args) => browse(&runtime, device, args).await,
    };
    runtime.shutdown();

    if cli.print_metrics {
        print!("{}", String::from_utf8_lossy(&metrics::gather()));
    }
    outcome
}

#[derive(Parser, Debug)]
#[command(
    name = "harbor",
    about = "Workspace client for a desktop paired through the harbor relay",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Relay websocket endpoint (overrides HARBOR_RELAY_URL)"
    )]
    relay_url: Option<String>,

    #[arg(long, global = true, env = "HARBOR_DEVICE_ID", help = "Paired desktop to follow")]
    device: Option<String>,

    #[arg(long, global = true, help = "Relay bearer token (overrides HARBOR_AUTH_TOKEN)")]
    token: Option<String>,

    #[arg(long, global = true, help = "Treat the workspace as offline-capable")]
    offline: bool,

    #[arg(long, global = true, help = "Run against an in-process scripted desktop")]
    demo: bool,

    #[arg(long, global = true, help = "Print prometheus counters on exit")]
    print_metrics: bool,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::from_env().context("invalid HARBOR_* environment")?;
        if let Some(raw) = &self.relay_url {
            config.relay_url = parse_relay_url(raw).context("invalid --relay-url")?;
        }
        if let Some(token) = &self.token {
            config.auth_token = Some(token.clone());
        }
        if self.offline {
            config.offline_mode = true;
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "HARBOR_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "HARBOR_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self, client: &ClientConfig) -> LogConfig {
        LogConfig::for_client(client, self.level, self.file.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the device and print workspace connectivity changes (default)
    Watch(WatchArgs),
    /// Load a folder listing from the desktop
    Browse(BrowseArgs),
}

#[derive(Args, Debug, Default)]
struct WatchArgs {
    #[arg(long, value_name = "SECS", help = "Stop after this many seconds instead of waiting for Ctrl-C")]
    seconds: Option<u64>,
}

#[derive(Args, Debug)]
struct BrowseArgs {
    #[arg(value_name = "PATH", help = "Directory on the desktop to list")]
    path: String,
}

async fn watch(runtime: &WorkspaceRuntime, device: DeviceId, args: WatchArgs) -> Result<()> {
    let mut events = runtime.machine().subscribe();
    let supervisor = runtime.supervisor().clone();
    supervisor.set_active_device(Some(device.clone()));
    tokio::spawn(async move {
        if let Err(err) = supervisor
            .connect(&device, ConnectReason::UserSelected)
            .await
        {
            warn!(device = %device, error = %err, "initial connect failed");
        }
    });

    let limit = async {
        match args.seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(limit);

    loop {
        tokio::select! {
            _ = &mut limit => break,
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(BusError::Lagged(skipped)) => {
                        warn!(skipped, "workspace events skipped");
                        continue;
                    }
                    Err(err) => return Err(anyhow!("workspace feed ended: {err}")),
                };
                match event.payload {
                    WorkspaceEvent::ConnectivityChanged { from, to } => println!(
                        "connectivity {} -> {}",
                        from.map(|s| s.as_str()).unwrap_or("none"),
                        to.map(|s| s.as_str()).unwrap_or("none"),
                    ),
                    WorkspaceEvent::BannerShown => println!("banner shown"),
                    WorkspaceEvent::BannerCleared => println!("banner cleared"),
                    WorkspaceEvent::DeviceSelectionRequired { device, code } => {
                        println!("device {device} needs to be selected again ({code})");
                    }
                    other => debug!(event = ?other, "workspace event"),
                }
            }
        }
    }
    Ok(())
}

async fn browse(runtime: &WorkspaceRuntime, device: DeviceId, args: BrowseArgs) -> Result<()> {
    if let Err(err) = runtime.select_device(device.clone()).await {
        warn!(device = %device, error = %err, "connect failed; loading anyway");
    }
    let mut updates = runtime.folders().updates();
    let handle = runtime.folders().browse(args.path.clone());
    let budget = runtime.config().load_timeout + Duration::from_secs(1);

    let settled = tokio::time::timeout(budget, async {
        while let Some(view) = updates.next().await {
            if view.generation != handle.generation() {
                continue;
            }
            if let Some(err) = &view.error {
                return Err(anyhow!("listing {} failed: {err} ({})", args.path, err.code()));
            }
            if let Some(listing) = &view.value {
                println!("{} ({:?}, {} folders)", listing.path, view.tier, listing.folders.len());
            }
            if !view.is_loading && view.tier == Some(Tier::Full) {
                return Ok(view);
            }
        }
        Err(anyhow!("folder browser closed"))
    })
    .await;

    match settled {
        Ok(Ok(view)) => {
            if let Some(listing) = view.value {
                for folder in listing.folders {
                    println!("  {}", folder.path);
                }
            }
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            // Fast data may have rendered even though hydration never landed.
            let view = runtime.folders().view();
            match view.value {
                Some(listing) => {
                    for folder in listing.folders {
                        println!("  {}", folder.path);
                    }
                    Ok(())
                }
                None => Err(anyhow!("listing {} did not complete", args.path)),
            }
        }
    }
}

/// A desktop that answers folder listings and session reads after short delays.
fn demo_relay() -> ScriptedRelay {
    let relay = ScriptedRelay::new();
    relay.set_connect_delay(Duration::from_millis(300));
    relay.set_responder(|_, request| {
        let path = request
            .params
            .get("directoryPath")
            .and_then(|v| v.as_str())
            .unwrap_or("/")
            .trim_end_matches('/')
            .to_string();
        match request.method.as_str() {
            "fs.listFolders" => {
                let detailed = request.params.get("includeMetadata").is_some();
                let folders: Vec<_> = ["src", "docs", "tests"]
                    .iter()
                    .map(|name| {
                        let mut entry = json!({ "name": name, "path": format!("{path}/{name}") });
                        if detailed {
                            entry["childCount"] = json!(name.len());
                        }
                        entry
                    })
                    .collect();
                let delay = if detailed { 400 } else { 120 };
                ScriptedResponse::value(Duration::from_millis(delay), json!({ "folders": folders }))
            }
            "session.getOverview" => ScriptedResponse::value(
                Duration::from_millis(80),
                json!({ "overview": { "id": request.params["sessionId"], "name": "demo" } }),
            ),
            "session.get" => ScriptedResponse::value(
                Duration::from_millis(300),
                json!({ "session": { "id": request.params["sessionId"], "name": "demo", "includedFiles": [] } }),
            ),
            _ => ScriptedResponse::value(Duration::from_millis(50), json!({})),
        }
    });
    relay
}
