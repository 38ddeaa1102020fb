use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use race_supervisor::store::{ServerOptions, StaticStore, StrackerOptions};
use race_supervisor::{Collaborators, RaceEvent, ServerProcess, SupervisorConfig, UdpAddressing, UdpMessage};

const DEFAULT_CONFIG_PATH: &str = "config/supervisor.toml";

/// Tables the binary reads next to the supervisor settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LaunchFile {
    server_options: ServerOptions,
    stracker: Option<StrackerOptions>,
    session: Option<toml::Value>,
}

/// Session descriptor loaded from the `[session]` table
#[derive(Debug)]
struct JsonRaceEvent(serde_json::Value);

impl RaceEvent for JsonRaceEvent {
    fn describe(&self) -> String {
        self.0.to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::info!("Race supervisor starting");

    let config_path = std::env::var("RACE_SUPERVISOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = SupervisorConfig::load(&config_path)?;

    let launch: LaunchFile = match std::fs::read_to_string(&config_path) {
        Ok(s) => toml::from_str(&s).with_context(|| format!("Invalid launch tables in {}", config_path.display()))?,
        Err(_) => LaunchFile::default(),
    };
    let session = serde_json::to_value(launch.session.unwrap_or_else(|| toml::Value::Table(Default::default())))
        .context("Could not convert session table")?;

    let addressing = UdpAddressing::new(
        launch.server_options.udp_plugin_address.clone(),
        launch.server_options.udp_plugin_local_port,
    );
    let store = Arc::new(StaticStore::new(launch.server_options, launch.stracker));

    let server = ServerProcess::new(
        config,
        Collaborators::new(store),
        Arc::new(|message: UdpMessage| {
            tracing::debug!("UDP plugin message ({} bytes)", message.as_bytes().len());
        }),
    );

    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(1);
    server.notify_done(done_tx);

    server.start(Arc::new(JsonRaceEvent(session)), addressing).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping server...");
            if let Err(e) = server.stop().await {
                tracing::error!("[{}] {}", e.error_code(), e);
                if e.is_ambiguous() {
                    server.wait_idle().await?;
                }
            }
        }
        _ = done_rx.recv() => {
            tracing::info!("Server process exited");
        }
    }

    tracing::info!("Race supervisor shutting down");
    Ok(())
}
