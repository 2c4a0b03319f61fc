use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::config::AppConfig;
use crate::core::events::EventBus;
use crate::core::images::ManifestCatalog;
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::Orchestrator;
use crate::core::store::Store;
use crate::core::terminal::{self, GuideSection};
use crate::core::transport::{CommandProtocol, DeviceConnector};
use crate::interfaces::web::ApiServer;
use crate::logging;

/// Boot the daemon and block until Ctrl+C.
pub async fn run_daemon(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = AppConfig::load(config_path).await?;
    config.validate()?;
    let level = config.log_level()?;
    let log_tx = logging::init(level, true);

    let credentials = config.credentials()?;
    let data_dir = config.data_dir();
    let store = Store::open(&data_dir)
        .await
        .with_context(|| format!("opening store in {}", data_dir.display()))?;
    let bus = EventBus::new(store.clone(), config.workers.event_capacity);
    let manifest = config.manifest_path();
    if !manifest.exists() {
        warn!(
            "Image manifest {} not found; the catalog is empty.",
            manifest.display()
        );
    }
    let transport = config.transport_settings();
    let orchestrator = Orchestrator::new(
        store,
        bus,
        Arc::new(DeviceConnector::new(credentials, transport.clone())),
        Arc::new(ManifestCatalog::new(manifest)),
        transport,
        config.orchestrator_settings(),
    );

    let mut lifecycle = LifecycleManager::new().await?;
    orchestrator
        .attach_scheduler(lifecycle.scheduler.clone())
        .await;
    orchestrator
        .install_sweep(&lifecycle.scheduler, &config.scheduler.sweep_cron)
        .await?;

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let api = ApiServer::new(orchestrator.clone(), log_tx, host.clone(), port);
    lifecycle.attach(Arc::new(Mutex::new(orchestrator)));
    lifecycle.attach(Arc::new(Mutex::new(api)));
    lifecycle.start().await?;

    terminal::print_banner();
    GuideSection::new("fwpilot daemon")
        .status("Data", &data_dir.display().to_string())
        .status("Workers", &config.workers.max_concurrent.to_string())
        .status("Timezone", &config.scheduler.default_timezone)
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();
    terminal::print_link("API", &format!("http://{}:{}/api", host, port));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down fwpilot...");
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}

/// Load and validate the config without starting anything.
pub async fn check_config(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path).await?;
    config.validate()?;
    let transport = config.transport_settings();

    GuideSection::new("Configuration")
        .status("File", &config_path.display().to_string())
        .status(
            "Listen",
            &format!("{}:{}", config.server.host, config.server.port),
        )
        .status("Data", &config.data_dir().display().to_string())
        .status("Manifest", &config.manifest_path().display().to_string())
        .status(
            "Image server",
            config.images.base_url.as_deref().unwrap_or("(not set)"),
        )
        .status("Workers", &config.workers.max_concurrent.to_string())
        .status("Sweep", &config.scheduler.sweep_cron)
        .status(
            "Command channel",
            &format!(
                "{} port {}",
                transport.command_protocol.as_str(),
                transport.command_port
            ),
        )
        .print();

    if transport.command_protocol == CommandProtocol::Telnet {
        terminal::print_warn("Telnet sends device credentials in cleartext.");
    }

    terminal::print_info(&format!(
        "Device credentials are read from ${} and ${}.",
        config.transport.username_env, config.transport.password_env
    ));
    match config.credentials() {
        Ok(_) => terminal::print_success("Configuration is valid."),
        Err(e) => terminal::print_warn(&format!("Configuration is valid, but {}", e)),
    }
    Ok(())
}
