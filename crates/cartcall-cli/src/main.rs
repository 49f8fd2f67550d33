//! cartcall - voice shopping call client

mod config;
mod demo;
mod report;

use cartcall_session::{Orchestrator, Phase, SessionConfig};
use cartcall_transport::{ConnectConfig, GatewayTransport, ScriptedTransport, Transport};
use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// cartcall - talk to a voice shopping assistant
#[derive(Parser, Debug)]
#[command(name = "cartcall")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session gateway URL (default: from config)
    #[arg(short, long)]
    gateway_url: Option<String>,

    /// Gateway bearer token (default: config or CARTCALL_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Room to join
    #[arg(short, long)]
    room: Option<String>,

    /// Participant identity
    #[arg(short, long)]
    identity: Option<String>,

    /// Play a scripted call offline instead of connecting to a gateway
    #[arg(long)]
    demo: bool,

    /// Delay between scripted demo events, in milliseconds
    #[arg(long, default_value_t = 400)]
    demo_step_ms: u64,

    /// Keep the call open after an order is placed
    #[arg(long)]
    stay_after_order: bool,

    /// Print every snapshot as a JSON line
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("cartcall=debug")
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    // Merge config with CLI args (CLI takes precedence)
    let connect = ConnectConfig {
        url: args
            .gateway_url
            .clone()
            .or(cfg.gateway_url.clone())
            .unwrap_or_default(),
        token: args.token.clone().or_else(|| cfg.get_token()),
        room: args
            .room
            .clone()
            .or(cfg.room.clone())
            .unwrap_or_else(|| "shop".to_string()),
        identity: args
            .identity
            .clone()
            .or(cfg.identity.clone())
            .unwrap_or_else(|| "shopper".to_string()),
        ..Default::default()
    };
    if !args.demo && connect.url.is_empty() {
        anyhow::bail!("No gateway URL configured. Pass --gateway-url, set gateway_url in the config file, or use --demo");
    }

    let mut session = SessionConfig {
        connect,
        ..Default::default()
    };
    cfg.session.apply(&mut session);
    if args.stay_after_order {
        session.end_on_order_placed = false;
    }

    let scripted = args.demo.then(ScriptedTransport::new);
    let transport: Arc<dyn Transport> = match &scripted {
        Some(scripted) => Arc::new(scripted.clone()),
        None => Arc::new(GatewayTransport::new()),
    };

    run_call(session, transport, scripted, &args).await
}

async fn run_call(
    session: SessionConfig,
    transport: Arc<dyn Transport>,
    scripted: Option<ScriptedTransport>,
    args: &Args,
) -> anyhow::Result<()> {
    let handle = Orchestrator::spawn(session, transport);

    // Spawn snapshot printer
    let mut snapshots = Box::pin(handle.snapshot_stream());
    let json = args.json;
    let printer = tokio::spawn(async move {
        let mut reporter = report::Reporter::new();
        while let Some(snapshot) = snapshots.next().await {
            if json {
                match serde_json::to_string(&*snapshot) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("Failed to encode snapshot: {}", e),
                }
                continue;
            }
            for line in reporter.render(&snapshot) {
                println!("{}", line);
            }
        }
    });

    let session_id: uuid::Uuid = handle.start_call().await?;
    if !json {
        let started = handle
            .snapshot()
            .session
            .as_ref()
            .map(|s| s.created_at.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!("Call {} started {} (Ctrl+C to hang up)", session_id, started);
    }

    if let Some(scripted) = scripted {
        let handle = handle.clone();
        let step = Duration::from_millis(args.demo_step_ms);
        tokio::spawn(async move {
            if let Err(e) = demo::play(scripted, handle, step).await {
                tracing::warn!("Demo script stopped: {}", e);
            }
        });
    }

    tokio::select! {
        ended = handle.wait_for(|s| s.phase.is_terminal()) => {
            ended?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n[hanging up]");
            handle.stop_call().await?;
        }
    }

    // Wait a bit for final snapshots
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;
    printer.abort();

    if handle.snapshot().phase == Phase::Failed {
        std::process::exit(1);
    }
    Ok(())
}
