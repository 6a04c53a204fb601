use clap::Parser;
use relaymq::{BridgeConfig, BridgeServer, MqttBus, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(about = "Bridge between TCP line-protocol clients and an MQTT message bus")]
struct Args {
    /// TCP listening port
    port: Option<u16>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    // environment overrides layer over the defaults; the CLI port wins
    let mut config = BridgeConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("Starting relaymq bridge on {}:{}", config.host, config.port);
    info!("Bus endpoint: {}:{}", config.bus_host, config.bus_port);
    info!("Topic filter: {}", config.topic_filter);
    info!("Pool capacity: {}", config.max_connections);

    let bus = MqttBus::connect(&config);
    let server = BridgeServer::bind(config, bus).await?;

    install_signal_shims(server.run_flag(), server.dump_flag());

    server.run().await?;

    info!("relaymq shut down cleanly");
    Ok(())
}

/// Translate process signals into the flags the event loop observes once
/// per tick: SIGINT/SIGTERM clear the run flag, SIGUSR1 requests a pool
/// snapshot dump.
fn install_signal_shims(running: Arc<AtomicBool>, dump: Arc<AtomicBool>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        running.store(false, Ordering::SeqCst);
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("could not install SIGUSR1 handler: {}", e);
                return;
            }
        };
        while usr1.recv().await.is_some() {
            dump.store(true, Ordering::SeqCst);
        }
    });
    #[cfg(not(unix))]
    drop(dump);
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
