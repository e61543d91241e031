//! Relaynode - node-side supervisor for sing-box and xray

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use relaynode::backend::SingboxBackend;
use relaynode::error::Result;
use relaynode::service::NodeService;
use relaynode::{MemoryStorage, NodeStorage, Settings, VpnBackend};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let settings = Settings::from_env();

    info!("Relaynode v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args, settings))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(args: Args, settings: Settings) -> Result<()> {
    let storage: Arc<dyn NodeStorage> = Arc::new(MemoryStorage::new());
    let backend = SingboxBackend::new(
        &args.executable,
        &args.config,
        storage.clone(),
        settings,
    );

    // A missing or broken local config is not fatal: the orchestrator can
    // push a fresh one through RestartBackend at any time.
    if args.config.exists() {
        if let Err(e) = backend.start(None).await {
            warn!("failed to start sing-box from {}: {}", args.config.display(), e);
        }
    } else {
        info!(
            "no config at {}, waiting for the orchestrator",
            args.config.display()
        );
    }

    let addr = args
        .listen
        .parse()
        .map_err(|e| relaynode::Error::Config(format!("invalid listen address: {}", e)))?;

    let backends: Vec<(String, Arc<dyn VpnBackend>)> =
        vec![("sing-box".to_string(), backend.clone() as Arc<dyn VpnBackend>)];
    let service = NodeService::new(storage, backends);

    info!("control service listening on {}", addr);
    let serve = tonic::transport::Server::builder()
        .add_service(service.into_server())
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        });

    if let Err(e) = serve.await {
        error!("control service error: {}", e);
    }

    backend.shutdown().await;
    Ok(())
}

/// Command line arguments
struct Args {
    config: PathBuf,
    executable: PathBuf,
    listen: String,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = PathBuf::from("/etc/relaynode/singbox.json");
        let mut executable = PathBuf::from("sing-box");
        let mut listen = "127.0.0.1:50051".to_string();
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = PathBuf::from(&args[i + 1]);
                        i += 1;
                    }
                }
                "--exe" => {
                    if i + 1 < args.len() {
                        executable = PathBuf::from(&args[i + 1]);
                        i += 1;
                    }
                }
                "--listen" => {
                    if i + 1 < args.len() {
                        listen = args[i + 1].clone();
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            executable,
            listen,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Relaynode - node-side supervisor for sing-box and xray

USAGE:
    relaynode [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to the sing-box config file
                            (default: /etc/relaynode/singbox.json)
    --exe <PATH>            Path to the sing-box executable (default: sing-box)
    --listen <ADDR>         Control service listen address (default: 127.0.0.1:50051)
    -v, --version           Print version information
    -h, --help              Print help information

ENVIRONMENT:
    RUST_LOG                        Log level (default: info)
    LOG_BUFFER_SIZE                 Retained engine log lines (default: 100)
    STOP_TIMEOUT                    Seconds before SIGKILL escalation (default: 3)
    STARTUP_TIMEOUT                 Seconds to wait for xray readiness (default: 4)
    USER_MOD_INTERVAL               Seconds between reload ticks (default: 10)
    RESTART_ON_FAILURE              Restart a crashed engine (default: false)
    RESTART_ON_FAILURE_INTERVAL     Seconds before such a restart (default: 5)
    RESTART_ON_FAILURE_MAX_RETRIES  0 means retry forever (default: 0)
    STATS_API_HOST                  Engine stats API host (default: 127.0.0.1)
    STATS_API_PORT                  Engine stats API port (default: 8081)

EXAMPLES:
    relaynode -c /etc/relaynode/singbox.json --listen 0.0.0.0:50051
"#
    );
}

fn print_version() {
    println!("Relaynode v{}", env!("CARGO_PKG_VERSION"));
    println!("Node-side supervisor for sing-box and xray");
}
