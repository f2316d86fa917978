use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use vdi_lite::config::{NodeConfig, TokenCipher, TokenConfig};
use vdi_lite::node::Node;
use vdi_lite::session::DispatchMode;
use vdi_lite::shutdown::install_shutdown_handler;
use vdi_lite::token::{ConnectionDescriptor, TokenSealer};

#[derive(Parser, Debug)]
#[command(name = "vdi-lite")]
#[command(version)]
#[command(about = "Session scheduler for exam remote desktops")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler (registry, desktop pool, idle reaper, HTTP API)
    Server(ServerArgs),

    /// Seal or open gateway tokens locally
    Token {
        #[command(flatten)]
        key: KeyArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: TokenCommands,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct KeyArgs {
    /// Shared token key: 32 raw bytes or 64 hex characters
    #[arg(long, env = "VDI_TOKEN_KEY", hide_env_values = true)]
    token_key: String,

    /// Token cipher (aes-256-cbc or chacha20-poly1305)
    #[arg(long, env = "VDI_TOKEN_CIPHER", default_value = "aes-256-cbc")]
    token_cipher: String,
}

impl KeyArgs {
    fn token_config(&self) -> Result<TokenConfig, Box<dyn std::error::Error>> {
        let cipher: TokenCipher = self.token_cipher.parse()?;
        Ok(TokenConfig::new(self.token_key.clone(), cipher))
    }
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the HTTP API listens on
    #[arg(long, env = "VDI_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    #[command(flatten)]
    key: KeyArgs,

    /// Seconds without a heartbeat before a worker is unhealthy (min 10)
    #[arg(long, env = "VDI_HEARTBEAT_TTL_SECS", default_value = "120")]
    heartbeat_ttl_secs: u64,

    /// Seconds without activity before a desktop is reclaimed
    #[arg(long, env = "VDI_IDLE_TIMEOUT_SECS", default_value = "600")]
    idle_timeout_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, env = "VDI_SWEEP_INTERVAL_SECS", default_value = "60")]
    sweep_interval_secs: u64,

    /// Where sessions come from for exams without an override
    #[arg(long, env = "VDI_DEFAULT_DISPATCH", default_value = "desktop-pool")]
    default_dispatch: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TokenCommands {
    /// Seal a connection descriptor into a token
    Seal {
        #[arg(long)]
        hostname: String,
        #[arg(long, default_value = "3389")]
        port: String,
        #[arg(long, default_value = "rdp")]
        protocol: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        width: Option<String>,
        #[arg(long)]
        height: Option<String>,
    },
    /// Open a token and print its descriptor
    Open {
        /// The token, as received by the gateway
        token: String,
    },
}

#[derive(Serialize)]
struct SealOutput {
    token: String,
    cipher: String,
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let default_dispatch: DispatchMode = args.default_dispatch.parse()?;
    let config = NodeConfig::new(args.listen, args.key.token_config()?)
        .with_heartbeat_ttl_secs(args.heartbeat_ttl_secs)
        .with_idle_timeout_secs(args.idle_timeout_secs)
        .with_sweep_interval_secs(args.sweep_interval_secs)
        .with_default_dispatch(default_dispatch);

    tracing::info!(
        listen_addr = %config.listen_addr,
        cipher = %config.token.cipher,
        heartbeat_ttl_secs = config.registry.heartbeat_ttl().num_seconds(),
        idle_timeout_secs = config.reaper.idle_timeout_secs,
        sweep_interval_secs = config.reaper.sweep_interval_secs,
        default_dispatch = %config.default_dispatch,
        "Starting vdi-lite scheduler"
    );

    let cancel = install_shutdown_handler()?;
    let node = Node::new(config)?;
    node.run(cancel).await;
    Ok(())
}

// =============================================================================
// Token commands
// =============================================================================

fn handle_token(
    key: &KeyArgs,
    output: &OutputFormat,
    command: TokenCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let sealer = TokenSealer::new(&key.token_config()?)?;

    match command {
        TokenCommands::Seal {
            hostname,
            port,
            protocol,
            username,
            password,
            width,
            height,
        } => {
            let width = width.map(serde_json::Value::String);
            let height = height.map(serde_json::Value::String);
            let descriptor = ConnectionDescriptor::new(protocol, hostname, port)
                .with_credentials(username.unwrap_or_default(), password.unwrap_or_default())
                .with_display_hints(width.as_ref(), height.as_ref());
            let token = sealer.seal(&descriptor)?;

            match output {
                OutputFormat::Json => {
                    let out = SealOutput {
                        token,
                        cipher: sealer.cipher().to_string(),
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => println!("{}", token),
            }
        }
        TokenCommands::Open { token } => {
            let descriptor = match sealer.open(&token) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };

            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&descriptor)?),
                OutputFormat::Table => {
                    let settings = &descriptor.connection.settings;
                    println!("Protocol: {}", descriptor.connection.protocol);
                    println!("Hostname: {}", settings.hostname);
                    println!("Port:     {}", settings.port);
                    if let Some(ref username) = settings.username {
                        println!("Username: {}", username);
                    }
                    if let (Some(w), Some(h)) = (settings.width, settings.height) {
                        println!("Display:  {}x{}", w, h);
                    }
                    for (k, v) in &settings.options {
                        println!("{:<9} {}", format!("{}:", k), v);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Missing .env is fine; explicit flags and the environment still apply.
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Token {
            key,
            output,
            command,
        } => handle_token(&key, &output, command)?,
    }

    Ok(())
}
