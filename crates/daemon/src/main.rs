use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use usbgate_backend_udisks::UdisksBackend;
use usbgate_common::config::{load_config, AuthorizationMode, DEFAULT_CONFIG_PATH};
use usbgate_daemon::polkit::PolkitAuthorizer;
use usbgate_daemon::{DesktopNotifier, DeviceEventLoop, InterceptionEngine, NotificationDispatcher};

#[derive(Parser)]
#[command(name = "usbgate-daemon", version, about = "Blocks removable storage until authorized")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup_logging();
    let args = Args::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(target: "usbgate", event = "daemon_start", config = %args.config.display(), "usbgate-daemon starting");

    let mount = UdisksBackend::from_config(&config.mitigation);
    let dispatcher = NotificationDispatcher::new(Arc::new(DesktopNotifier), &config.notification);
    let mut engine = InterceptionEngine::new(Arc::new(mount), dispatcher.clone())
        .with_command_timeout(config.mitigation.command_timeout())
        .with_authorization_timeout(config.authorization.timeout());
    if config.authorization.mode == AuthorizationMode::Polkit {
        let authorizer = PolkitAuthorizer::connect(&config.authorization)
            .await
            .context("connecting to polkit")?;
        engine = engine.with_authorizer(Arc::new(authorizer));
    }
    let mut event_loop = DeviceEventLoop::new(engine);

    tokio::select! {
        res = run_event_loop(&mut event_loop) => res?,
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("received ctrl_c, exiting");
        }
    }
    dispatcher.drain().await;
    Ok(())
}

#[cfg(feature = "udev-monitor")]
async fn run_event_loop(event_loop: &mut DeviceEventLoop) -> Result<()> {
    use usbgate_daemon::udev_monitor::UdevEventSource;
    event_loop
        .run(UdevEventSource::default())
        .await
        .context("subscribing to udev block events")
}

#[cfg(not(feature = "udev-monitor"))]
async fn run_event_loop(_event_loop: &mut DeviceEventLoop) -> Result<()> {
    anyhow::bail!("built without the udev-monitor feature; no device event source available")
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
