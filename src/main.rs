use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatgate::config::GatewayConfig;
use chatgate::coordinator::{
    coordinator_router, AdmissionBackend, AdmissionCoordinator, CoordinatorHandle,
    RemoteCoordinator,
};
use chatgate::gateway::{serve_router, AppState, GatewayAdapter, GatewayServer, OpenAiClient};
use chatgate::ratelimit::{MemoryStore, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "chatgate", version, about = "Admission-controlled chat gateway")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the chat gateway (default)
    Serve {
        /// Override server.listen_addr
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Run a standalone shared admission coordinator
    Coordinator {
        #[arg(long, default_value = "127.0.0.1:8788")]
        listen: SocketAddr,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Chatgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load(cli.config.as_deref())?;
    config.validate()?;
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    match cli.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => run_gateway(config, listen).await?,
        Command::Coordinator { listen } => run_coordinator(config, listen).await?,
    }

    info!("Chatgate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatgate=info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn run_gateway(config: GatewayConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let admission = &config.admission;

    let (backend, local): (Arc<dyn AdmissionBackend>, Option<CoordinatorHandle>) =
        match admission.coordinator_url.as_deref() {
            Some(url) => {
                info!(coordinator_url = %url, "Using shared admission coordinator");
                let remote: Arc<dyn AdmissionBackend> =
                    Arc::new(RemoteCoordinator::new(url, admission.timeout())?);
                (remote, None)
            }
            None => {
                info!("Running in-process admission coordinator");
                let handle = AdmissionCoordinator::spawn(
                    MemoryStore::new(),
                    Arc::new(SystemClock),
                    admission.coordinator_options(),
                );
                let backend: Arc<dyn AdmissionBackend> = Arc::new(handle.clone());
                (backend, Some(handle))
            }
        };

    let limits = admission.limits()?;
    info!(
        source_address_max = limits.source_address.max_events(),
        credential_max = limits.credential.max_events(),
        failure_policy = ?admission.failure_policy,
        "Admission limits configured"
    );

    let adapter = GatewayAdapter::new(backend)
        .with_limits(limits)
        .with_timeout(admission.timeout())
        .with_policy(admission.failure_policy, admission.fail_closed_retry());

    let shared_token = secret_from_env(&config.auth.token_env);
    if shared_token.is_none() {
        warn!(
            env = %config.auth.token_env,
            "Shared token is not set, chat requests will be refused"
        );
    }
    let api_key = secret_from_env(&config.upstream.api_key_env);
    if api_key.is_none() {
        warn!(env = %config.upstream.api_key_env, "Upstream API key is not set");
    }

    let state = AppState {
        adapter: Arc::new(adapter),
        upstream: Arc::new(OpenAiClient::new(&config.upstream, api_key)?),
        shared_token,
        max_turns: config.upstream.max_turns,
    };

    let addr = listen.unwrap_or(config.server.listen_addr);
    GatewayServer::new(addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = local {
        handle.shutdown().await;
    }
    Ok(())
}

async fn run_coordinator(config: GatewayConfig, listen: SocketAddr) -> anyhow::Result<()> {
    let handle = AdmissionCoordinator::spawn(
        MemoryStore::new(),
        Arc::new(SystemClock),
        config.admission.coordinator_options(),
    );

    info!(addr = %listen, "Starting shared admission coordinator");
    serve_router(listen, coordinator_router(handle.clone()), shutdown_signal()).await?;

    handle.shutdown().await;
    Ok(())
}

fn secret_from_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
