use clap::Parser;
use heimdall_relay::config::{resolve_config_path, Config, CONFIG_ENV_VAR};
use heimdall_relay::logging::RelayLogger;
use heimdall_relay::server::ProxyServer;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP proxy balancing CONNECT tunnels across weighted upstream proxies",
    after_help = "Environment variables:\n  PROXY_CONFIG - Path to configuration file (overrides --config)"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(
        long,
        value_name = "FILE",
        help = "Generate a sample configuration file and exit"
    )]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        Config::sample().to_file(&path)?;
        println!("Sample configuration file generated: {}", path);
        return Ok(());
    }

    let config_path = resolve_config_path(args.config.as_deref());
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    match config.logging.clone() {
        Some(logging) => RelayLogger::init(logging)?,
        None => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init()
        }
    }

    write_pid_file();

    info!(
        "Configuration loaded from {} (env override: {})",
        config_path, CONFIG_ENV_VAR
    );
    info!("  - Server: {}", config.server.name);
    info!("  - Listen Address: {}", config.server.listen_address);
    info!("  - Stats Endpoint: {}", config.server.stats_endpoint);
    info!("  - Authentication: {}", config.authentication.enabled);
    if config.authentication.enabled {
        info!("  - Configured Users: {}", config.authentication.users.len());
        if config.authentication.users.is_empty() {
            warn!("Authentication enabled with no users; all CONNECT requests will be refused");
        }
    }
    info!(
        "  - Total Upstream Proxies: {}",
        config.upstream_proxies.len()
    );
    let enabled_count = config
        .upstream_proxies
        .iter()
        .filter(|u| u.enabled)
        .count();
    info!("  - Enabled Upstream Proxies: {}", enabled_count);

    let server = ProxyServer::new(config, &config_path);
    Arc::clone(&server).start_config_watcher();

    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Server failed: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Server task failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
        }
    }

    Ok(())
}

fn write_pid_file() {
    let pid_file = "proxy.pid";
    match std::fs::write(pid_file, format!("{}\n", std::process::id())) {
        Ok(()) => info!("PID file created: {}", pid_file),
        Err(e) => warn!("Failed to create PID file {}: {}", pid_file, e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
