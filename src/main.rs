use color_eyre::Result;
use hapticlink::config::{config_path, ensure_default_config, ConfigStore, VibeConfig};
use hapticlink::host::{HostCommand, HostLoop};
use hapticlink::session::{SessionHandle, SessionSettings, WebSocketTransport};
use hapticlink::vibration::VibrationController;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let store = setup_config().await?;
    let config = store.snapshot();

    info!("Starting device session for {}", config.server_address);
    let session = SessionHandle::spawn(
        Box::new(WebSocketTransport::default()),
        SessionSettings {
            server_address: Some(config.server_address.clone()),
            connect_on_start: config.connect_on_start,
            ..SessionSettings::default()
        },
    );

    let controller = VibrationController::new(store.subscribe(), session.dispatcher());

    let (command_tx, command_rx) = mpsc::channel(32);
    let _stdin_handle = tokio::spawn(read_commands(command_tx));

    print_help();
    HostLoop::new(controller, session, store, command_rx).run().await
}

async fn read_commands(commands: mpsc::Sender<HostCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match HostCommand::from_str(&line) {
                Ok(command) => {
                    if commands.send(command).await.is_err() {
                        debug!("Tick loop gone, stopping stdin reader");
                        return;
                    }
                }
                Err(e) => warn!("{}", e),
            },
            Ok(None) => {
                debug!("stdin closed");
                if commands.send(HostCommand::Quit).await.is_err() {
                    debug!("Tick loop already stopped");
                }
                return;
            }
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                return;
            }
        }
    }
}

fn print_help() {
    info!(
        "Commands: vibrate <0..1> | tap | relative <value> <relative_to> [min] | stop | resume | \
         mode <none|fixed|varied> | strength <x> | reconnect | disconnect | devices | status | \
         reload | quit"
    );
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
        .and_then(|level| Level::from_str(&level).ok())
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

async fn setup_config() -> Result<ConfigStore> {
    let path = config_path();
    ensure_default_config(&path).await?;

    let config = match VibeConfig::load(&path).await {
        Ok(config) => config,
        Err(e) => {
            warn!("{}, falling back to defaults", e);
            VibeConfig::default()
        }
    };
    Ok(ConfigStore::with_path(config, path))
}
