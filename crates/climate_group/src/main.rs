use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use climate_group::api;
use climate_group::engine::Engine;
use climate_group::engine::MemoryHost;
use climate_group::engine::RestoreStore;
use climate_group::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "climate-groupd")]
#[command(about = "Groups climate devices into one controllable entity")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration files, merged in order
    #[arg(value_name = "CONFIG", default_value = "climate-group.toml")]
    configs: Vec<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, diagnostics) = Config::from_files(&cli.configs).context("Invalid configuration")?;
    if !diagnostics.is_empty() {
        eprint!("{}", climate_group::format_diagnostics(&diagnostics));
    }

    if cli.check {
        println!("Configuration OK: {} group(s)", config.groups.len());
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets())
        .init();

    tracing::info!("climate-groupd starting");
    for path in &cli.configs {
        tracing::info!("Loaded config from: {}", path.display());
    }

    let host = Arc::new(MemoryHost::new());
    for (entity_id, device) in &config.simulation.devices {
        host.insert(device.to_entity_state(entity_id), device.behaviour);
    }
    tracing::info!("Simulating {} device(s)", config.simulation.devices.len());

    let restore = config.persistence.state_file.clone().map(RestoreStore::new);
    let mut engine = Engine::new(host.clone(), restore);
    engine.register_groups_from_config(&config);
    let engine = Arc::new(engine);

    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server = if config.api.enabled {
        let state = Arc::new(api::AppState::new(engine.clone(), Some(host.clone())));
        let (listen, port) = (config.api.listen, config.api.port);
        Some(tokio::spawn(async move {
            api::serve(listen, port, state, shutdown_rx).await
        }))
    } else {
        None
    };

    tracing::info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    let _ = shutdown_tx.send(());
    if let Some(server) = server {
        server
            .await
            .context("HTTP API task failed")?
            .context("HTTP API server failed")?;
    }

    runner.abort();
    engine.shutdown().await;

    tracing::info!("climate-groupd shutdown complete");
    Ok(())
}
