//! nativeguard CLI
//!
//! Drives the tunnel engine from the command line: bring a tunnel up,
//! validate a configuration, convert it to `.conf` form or generate keys.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing_subscriber::{fmt, EnvFilter};

use nativeguard::crypto::random::OsRandom;
use nativeguard::crypto::x25519;
use nativeguard::error::ProtocolError;
use nativeguard::keys::{encode_key, Identity, PeerKey};
use nativeguard::protocol::{transport, HandshakeEngine, Responder, TransportKeys};
use nativeguard::tunnel::platform;
use nativeguard::{KeyMaterial, NativeGuardError, TunnelConfig, TunnelManager, TunnelSettings};

/// nativeguard - WireGuard-style tunnel session manager
#[derive(Parser, Debug)]
#[command(name = "nativeguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and hold the tunnel until Ctrl+C or SIGTERM
    Connect {
        /// Tunnel configuration (.json or .conf)
        #[arg(short, long)]
        config: PathBuf,

        /// Engine settings as JSON
        #[arg(short, long)]
        settings: Option<PathBuf>,
    },
    /// Validate a configuration and run a local handshake self-test
    Check {
        /// Tunnel configuration (.json or .conf)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print a configuration in WireGuard .conf form
    Render {
        /// Tunnel configuration (.json or .conf)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate a new keypair
    Genkey,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<NativeGuardError>() {
            Some(err) => {
                eprintln!("Error [{}]: {}", err.code(), err.user_message());
                ExitCode::from(err.exit_code() as u8)
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(255)
            }
        },
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Connect { config, settings } => connect(&config, settings.as_deref()).await,
        Command::Check { config } => check(config.as_deref()),
        Command::Render { config } => {
            let config = load_config(&config)?;
            print!("{}", config.to_conf());
            Ok(())
        }
        Command::Genkey => {
            let (private, public) = x25519::generate_keypair(&mut rand::rngs::OsRng);
            println!("PrivateKey = {}", encode_key(&private));
            println!("PublicKey = {}", encode_key(&public));
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<TunnelConfig> {
    tracing::info!("Loading configuration from: {}", path.display());
    Ok(TunnelConfig::from_file(path).map_err(NativeGuardError::from)?)
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<TunnelSettings> {
    let Some(path) = path else {
        return Ok(TunnelSettings::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    TunnelSettings::from_json(&text)
        .with_context(|| format!("parsing settings in {}", path.display()))
}

async fn connect(config_path: &Path, settings_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let settings = load_settings(settings_path)?;
    let manager = TunnelManager::new(settings);

    if !manager.is_device_supported() {
        tracing::warn!("Raw packet I/O is unavailable; the tunnel will carry no traffic");
    }

    let mut updates = manager.status_updates();
    tokio::spawn(async move {
        while let Some(status) = updates.next().await {
            tracing::debug!("Status event: {}", status);
        }
    });

    manager.connect(&config).await?;
    tracing::info!("Tunnel {}. Press Ctrl+C to disconnect.", manager.status());

    if let Some(mut inbound) = manager.take_inbound().await {
        tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                tracing::debug!("Inbound packet: {} bytes", packet.len());
            }
        });
    }

    wait_for_shutdown().await?;
    tracing::info!("Shutting down...");
    manager.disconnect().await?;
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        let mut signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        signal.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = ctrl_c => result.context("installing Ctrl+C handler"),
        result = terminate => result.context("installing SIGTERM handler"),
    }
}

fn check(config_path: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = config_path {
        let config = load_config(path)?;
        let keys = KeyMaterial::load(&config).map_err(NativeGuardError::from)?;
        println!("Configuration OK");
        println!("  Public key:  {}", encode_key(keys.identity.public_key()));
        println!("  Peer:        {}", config.endpoint());
        println!("  Allowed IPs: {}", config.allowed_ips.len());
        println!("  MTU:         {}", config.mtu);
    }

    match platform::unsupported_reason() {
        None => println!("Packet I/O:    supported"),
        Some(reason) => println!("Packet I/O:    unsupported ({})", reason),
    }

    let started = Instant::now();
    self_test()?;
    println!("Self-test:     passed in {:?}", started.elapsed());
    Ok(())
}

/// Handshake against an in-process responder, then move one packet each way
fn self_test() -> Result<(), NativeGuardError> {
    let random = OsRandom;
    let (client_private, _) = x25519::generate_keypair(&mut rand::rngs::OsRng);
    let (server_private, _) = x25519::generate_keypair(&mut rand::rngs::OsRng);
    let client = Identity::from_private(&client_private);
    let server = Identity::from_private(&server_private);

    let mut responder = Responder::new(server.clone());
    responder.add_peer(*client.public_key(), None);

    let engine = HandshakeEngine::new();
    let peer = PeerKey {
        public_key: *server.public_key(),
        preshared_key: None,
    };
    let (transcript, initiation) = engine.begin_handshake(&client, &peer, &random)?;
    let pending = responder.consume_initiation(&initiation.to_bytes())?;
    let (response, server_keys) = responder.respond(pending, &random)?;
    let client_keys = engine.process_response(transcript, &response.to_bytes())?;

    let now = Instant::now();
    let client_keys = TransportKeys::new(client_keys, now);
    let server_keys = TransportKeys::new(server_keys, now);

    let outbound = transport::seal(&client_keys, b"self-test")?;
    let inbound = transport::seal(&server_keys, &transport::open(&server_keys, &outbound)?)?;
    let echoed = transport::open(&client_keys, &inbound)?;
    if echoed != b"self-test" {
        return Err(ProtocolError::HandshakeFailed {
            reason: "self-test payload mismatch".to_string(),
        }
        .into());
    }
    Ok(())
}
