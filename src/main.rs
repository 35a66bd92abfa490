//! LANrage daemon
//!
//! Creates or joins a party and keeps the overlay alive until SIGINT or
//! SIGTERM, then unwinds tunnels, interface and registration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use lanrage::control::http::HttpControlPlane;
use lanrage::error::{LanrageError, PlatformError};
use lanrage::wg::SystemBackend;
use lanrage::{PartyRuntime, Settings};

/// LANrage - virtual LAN for game parties over WireGuard
#[derive(Parser, Debug)]
#[command(name = "lanrage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to settings.json (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Create a new party with this name
    #[arg(long, value_name = "NAME", conflicts_with = "join")]
    create: Option<String>,

    /// Join an existing party by id
    #[arg(long, value_name = "PARTY_ID", conflicts_with = "create")]
    join: Option<String>,

    /// Display name shown to other party members
    #[arg(long, default_value = "player")]
    name: String,

    /// Control plane URL (overrides settings)
    #[arg(long)]
    control_url: Option<String>,

    /// Activate a built-in game profile's broadcast ports
    #[arg(long, value_name = "GAME")]
    game: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            exit_code(&e)
        }
    }
}

async fn run(args: Args) -> Result<(), LanrageError> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::load_default()?,
    };
    if let Some(url) = &args.control_url {
        settings.control.url = url.clone();
    }

    let control = Arc::new(HttpControlPlane::new(&settings.control.url));
    let runtime = PartyRuntime::new(
        settings,
        control,
        Arc::new(SystemBackend::new()),
        lanrage::keys::keys_dir()?,
        &args.name,
    )
    .await?;

    runtime.start().await?;
    tracing::info!(peer_id = %runtime.local_peer_id(), "LANrage core up");

    for game in &args.game {
        runtime.forwarder().activate_profile(game).await;
    }

    match (&args.create, &args.join) {
        (Some(name), _) => {
            let party_id = runtime.create_party(name).await?;
            println!("Party created: {party_id}");
        }
        (_, Some(party_id)) => {
            runtime.join_party(party_id, &args.name).await?;
            println!("Joined party {party_id}");
        }
        (None, None) => {
            tracing::info!("No party requested; running idle (use --create or --join)");
        }
    }

    wait_for_shutdown().await;

    tracing::info!("Shutting down");
    runtime.teardown().await;
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("\nReceived Ctrl+C"),
        _ = terminate => tracing::info!("\nReceived SIGTERM"),
    }
}

/// Get user-friendly error message
fn user_message(error: &LanrageError) -> String {
    match error {
        LanrageError::Platform(PlatformError::NotInstalled { tool }) => {
            format!(
                "WireGuard tooling is missing (`{tool}` not found).\n  \
                 Install wireguard-tools and try again."
            )
        }
        LanrageError::Platform(PlatformError::PermissionDenied { .. }) => {
            #[cfg(target_os = "linux")]
            return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                    sudo setcap cap_net_admin=eip ./lanrage"
                .to_string();
            #[cfg(not(target_os = "linux"))]
            return "Insufficient privileges. Run with sudo.".to_string();
        }
        LanrageError::Platform(PlatformError::InterfaceConflict { name }) => {
            format!(
                "Interface {name} already exists.\n  \
                 Another LANrage instance may be running."
            )
        }
        LanrageError::Party(e) => format!("{e}"),
        _ => format!("{error}"),
    }
}

/// Get exit code for error
fn exit_code(error: &LanrageError) -> ExitCode {
    match error {
        LanrageError::Config(_) => ExitCode::from(1),
        LanrageError::Platform(_) => ExitCode::from(2),
        LanrageError::Control(_) | LanrageError::Party(_) => ExitCode::from(3),
        LanrageError::Nat(_) => ExitCode::from(4),
        LanrageError::Ipam(_) => ExitCode::from(5),
        _ => ExitCode::from(255),
    }
}
