use anyhow::{Context, Result};
use rollcall_capture::DirectorySource;
use rollcall_core::oracle::UnconfiguredOracle;
use rollcall_core::stability::StabilityDetector;
use rollcall_core::{CommandOracle, DescriptorOracle, Kiosk, RecordStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod sampler;

const BUS_NAME: &str = "org.freedesktop.RollCall1";
const OBJECT_PATH: &str = "/org/freedesktop/RollCall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env().context("loading configuration")?;
    let kiosk_config = &config.kiosk;

    let store = SqliteStore::open(&kiosk_config.store.db_path)
        .await
        .with_context(|| format!("opening {}", kiosk_config.store.db_path.display()))?;

    let oracle: Arc<dyn DescriptorOracle> = match CommandOracle::from_config(&kiosk_config.oracle) {
        Some(oracle) => Arc::new(oracle),
        None => {
            tracing::warn!("no descriptor oracle configured (ROLLCALL_ORACLE_COMMAND); probes will fail");
            Arc::new(UnconfiguredOracle)
        }
    };

    let kiosk = Arc::new(Kiosk::new(
        Arc::new(store) as Arc<dyn RecordStore>,
        oracle,
        kiosk_config,
    ));
    let indexed = kiosk.reload().await.context("building signature index")?;
    let log = Arc::new(sampler::OutcomeLog::new(kiosk));

    let shutdown = CancellationToken::new();
    let (sampler, sampler_task) = match &config.frame_dir {
        Some(dir) => {
            let source = DirectorySource::follow(dir, Duration::from_millis(config.frame_poll_ms))
                .await
                .with_context(|| format!("opening frame directory {}", dir.display()))?
                .with_dark_threshold(kiosk_config.stability.dark_threshold);
            let detector = StabilityDetector::new(kiosk_config.stability.clone())
                .with_signature_side(kiosk_config.index.signature_side);
            let (handle, task) = sampler::spawn_sampler(
                Arc::clone(&log),
                detector,
                source,
                config.start_paused,
                shutdown.clone(),
            );
            (Some(handle), Some(task))
        }
        None => {
            tracing::info!("ROLLCALL_FRAME_DIR unset; live sampling disabled");
            (None, None)
        }
    };

    let service = dbus_interface::RollCallService::new(log, sampler);
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(identities = indexed, bus = BUS_NAME, "rollcalld ready");

    // Serve until interrupted.
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    shutdown.cancel();
    if let Some(task) = sampler_task {
        task.await?;
    }

    Ok(())
}
