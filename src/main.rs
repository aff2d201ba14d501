use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use switch_bridge::bridge::hub::{SubscriberHandle, Subscription};
use switch_bridge::bridge::DEFAULT_STATUS_LOG_LIMIT;
use switch_bridge::{Bridge, BridgeConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(BridgeConfig::default_path);
    if let Err(e) = BridgeConfig::ensure_default_config(&config_path).await {
        warn!("{}", e);
    }
    let config = BridgeConfig::load_or_default(&config_path).await;
    info!(
        "Starting bridge for broker {} (config: {})",
        config.mqtt.broker_addr(),
        config_path.display()
    );

    let bridge = Bridge::connect(&config)
        .await
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    let (handle, subscription) = bridge.register_subscriber().await?;
    let console = tokio::spawn(log_events(subscription));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        result = read_commands(&bridge, handle) => {
            if let Err(e) = result {
                error!("Console input failed: {}", e);
            }
        }
    }

    bridge.unregister_subscriber(handle).await;
    bridge.shutdown();
    let _ = console.await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Console stand-in for a real-time client: prints every broadcast event.
async fn log_events(mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!("{}", json),
            Err(e) => warn!("Could not render {}: {}", event.name(), e),
        }
    }
}

/// Reads commands from stdin. `state` and `logs` print queries, anything
/// else is issued as a device command.
async fn read_commands(bridge: &Bridge, handle: SubscriberHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "state" => {
                info!("MQTT session: {:?}", bridge.session_state());
                let report = bridge.status_report(DEFAULT_STATUS_LOG_LIMIT).await?;
                info!("{}", serde_json::to_string_pretty(&report)?);
            }
            "logs" => {
                for entry in bridge.all_logs().await? {
                    info!("{}", serde_json::to_string(&entry)?);
                }
            }
            command => {
                let result = match command.strip_prefix("raw ") {
                    Some(raw) => bridge.issue_realtime_command(handle, raw).await,
                    None => bridge.issue_command(command).await,
                };
                if result.success {
                    info!("{}: {}", command, result.message);
                } else {
                    warn!("{}: {}", command, result.message);
                }
            }
        }
    }
    Ok(())
}
