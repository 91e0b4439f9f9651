use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use face_relay::config::ConfigStore;
use face_relay::state::AppState;
use face_relay::utils::{bind_tcp_listener, resolve_bind_address};
use face_relay::video::FrameTransformer;
use face_relay::web;
use face_relay::webrtc::{RtcTransportFactory, SessionRegistry, SignalingEndpoint};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// face-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "face-relay")]
#[command(version, about = "WebRTC relay that replaces faces in the echoed video", long_about = None)]
struct CliArgs {
    /// Host for the HTTP server (overrides config)
    #[arg(short = 'a', long, value_name = "HOST")]
    host: Option<String>,

    /// Port for the HTTP server (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "face-relay.toml")]
    config: PathBuf,

    /// Image pasted over detected faces (overrides config; built-in image if unset)
    #[arg(long, value_name = "FILE")]
    substitute_image: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting face-relay v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::load(&args.config).await?;

    // CLI overrides are runtime-only and never written back
    let config = config_store.override_with(|config| {
        if let Some(host) = args.host {
            config.web.bind_address = host;
        }
        if let Some(port) = args.port {
            config.web.http_port = port;
        }
        if let Some(path) = args.substitute_image {
            config.transform.substitute_image = path.to_string_lossy().to_string();
        }
    });

    let transformer = Arc::new(FrameTransformer::from_config(&config.transform)?);
    tracing::info!(
        "Substitute image {} ({}x{}), detector: {}",
        if config.transform.substitute_image.is_empty() {
            "<built-in>"
        } else {
            config.transform.substitute_image.as_str()
        },
        transformer.substitute().width(),
        transformer.substitute().height(),
        transformer.detector_name()
    );

    let factory = Arc::new(RtcTransportFactory::new(
        config.webrtc.clone(),
        config.encoder.clone(),
        config.transform.log_throttle_secs,
    ));
    let registry = Arc::new(SessionRegistry::new(config.webrtc.max_sessions));
    let endpoint = Arc::new(SignalingEndpoint::new(
        registry.clone(),
        factory,
        transformer,
        config.transform.log_throttle_secs,
    ));

    let state = AppState::new(config_store, endpoint);
    let app = web::create_router(state);

    let addr = resolve_bind_address(&config.web.bind_address, config.web.http_port)?;
    let listener = bind_tcp_listener(addr)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let closed = registry.close_all().await;
    tracing::info!("Closed {} peer session(s)", closed);
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "face_relay=error,tower_http=error",
        LogLevel::Warn => "face_relay=warn,tower_http=warn",
        LogLevel::Info => "face_relay=info,tower_http=info",
        LogLevel::Verbose => "face_relay=debug,tower_http=info",
        LogLevel::Debug => "face_relay=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "face_relay=trace,tower_http=debug,webrtc=debug",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
