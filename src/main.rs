// Intermud3 Gateway server
//
// Entry point: load configuration, bring up the gateway core and the
// downstream API, then wait for a shutdown signal.

use i3_gateway::util::shutdown::{GracefulShutdown, ShutdownConfig};
use i3_gateway::{Gateway, Settings, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};

fn log_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("I3_GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());

    let settings = if PathBuf::from(&config_path).exists() {
        match Settings::load(&PathBuf::from(&config_path)) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("fatal: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Settings::default()
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level(&settings.logging.level))
        .with_target(false)
        .init();

    info!(version = VERSION, mud = %settings.mud.name, "starting Intermud3 gateway");

    let api_host = settings.gateway.host.clone();
    let api_port = settings.gateway.port;
    let gateway = Gateway::new(settings);

    if let Err(e) = gateway.start().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig::default()));
    shutdown.install_signal_handlers();
    {
        let gateway = Arc::clone(&gateway);
        shutdown.register_cleanup(
            "gateway",
            Box::new(move || {
                let gateway = Arc::clone(&gateway);
                Box::pin(async move {
                    gateway.shutdown().await;
                    Ok(())
                })
            }),
        );
    }

    {
        let gateway = Arc::clone(&gateway);
        let host = api_host.clone();
        tokio::spawn(async move {
            if let Err(e) = i3_gateway::api::serve(gateway, &host, api_port).await {
                error!(error = %e, "API server stopped");
            }
        });
    }

    // Plain-TCP JSON-RPC rides one port above the HTTP/WebSocket surface
    {
        let gateway = Arc::clone(&gateway);
        let host = api_host.clone();
        tokio::spawn(async move {
            if let Err(e) = i3_gateway::api::rpc::serve_tcp(gateway, &host, api_port + 1).await {
                error!(error = %e, "TCP RPC server stopped");
            }
        });
    }

    shutdown.wait_for_shutdown().await;
    shutdown.wait_for_completion().await;

    let stats = shutdown.stats();
    info!(forced = stats.forced, "gateway exited");
    std::process::exit(if stats.forced { 1 } else { 0 });
}
