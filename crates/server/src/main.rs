use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{WrapErr, eyre};
use registry_auth::api::{TokenServerState, start_webserver};
use registry_auth::auth::users::hash_password;
use registry_auth::config::{build_components, load_config};
use registry_auth::registry::register_builtin_factories;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Token authentication server for Docker/OCI registries
#[derive(Parser, Debug)]
#[command(name = "registry-auth", version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, short, value_name = "PATH", default_value = "config.yaml", env = "REGISTRY_AUTH_CONFIG")]
    config: PathBuf,

    /// Address to listen on, overrides `server.listen_addr`
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// Authentication realm, overrides `server.realm`
    #[arg(long)]
    realm: Option<String>,

    /// Log at debug level regardless of RUST_LOG
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a password from stdin and print its Argon2id hash for a user entry
    HashPassword,
}

fn initialize_tracing(debug: bool) {
    let env_filter = if debug {
        EnvFilter::new("registry_auth=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("registry_auth=info,tower_http=info"))
    };

    let layer = fmt::layer().with_target(true).with_level(true);
    tracing_subscriber::registry().with(env_filter).with(layer).init();
}

fn print_password_hash() -> color_eyre::eyre::Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .wrap_err("reading password from stdin")?;

    let password = input.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err(eyre!("empty password"));
    }

    let hash = hash_password(password).map_err(|e| eyre!("hashing password: {e}"))?;
    println!("{hash}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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

    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    if let Some(Command::HashPassword) = args.command {
        return print_password_hash();
    }

    initialize_tracing(args.debug);

    // Factories must be in place before configuration is resolved.
    register_builtin_factories();

    let mut overrides = Vec::new();
    if let Some(addr) = args.addr {
        overrides.push(("server.listen_addr", addr));
    }
    if let Some(realm) = args.realm {
        overrides.push(("server.realm", realm));
    }

    let config = load_config(&args.config, &overrides)
        .wrap_err_with(|| format!("loading configuration from {}", args.config.display()))?;
    let addr = config.server.socket_addr()?;

    let service = build_components(&config)
        .and_then(|components| components.into_token_service())
        .wrap_err("building components")?;

    tracing::info!(
        realm = %config.server.realm,
        request_timeout = config.server.request_timeout,
        rotate_refresh_tokens = config.server.rotate_refresh_tokens,
        password_authenticator = %config.password_authenticator.kind,
        authorizer = %config.authorizer.kind,
        "configuration loaded"
    );

    start_webserver(TokenServerState::new(service, &config.server), addr, shutdown_signal()).await
}
