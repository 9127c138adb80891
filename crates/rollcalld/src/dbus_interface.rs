use crate::sampler::{OutcomeLog, SamplerHandle};
use image::DynamicImage;
use rollcall_capture::decode_image;
use rollcall_core::Fault;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zbus::interface;

/// D-Bus interface for the RollCall kiosk daemon.
///
/// Bus name: org.freedesktop.RollCall1
/// Object path: /org/freedesktop/RollCall1
pub struct RollCallService {
    log: Arc<OutcomeLog>,
    sampler: Option<SamplerHandle>,
}

impl RollCallService {
    pub fn new(log: Arc<OutcomeLog>, sampler: Option<SamplerHandle>) -> Self {
        Self { log, sampler }
    }

    fn sampler(&self) -> zbus::fdo::Result<&SamplerHandle> {
        self.sampler.as_ref().ok_or_else(|| {
            zbus::fdo::Error::NotSupported("live sampling is disabled (ROLLCALL_FRAME_DIR unset)".into())
        })
    }
}

async fn load_probe(image_path: &str) -> zbus::fdo::Result<DynamicImage> {
    let bytes = tokio::fs::read(image_path)
        .await
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{image_path}: {e}")))?;
    tokio::task::spawn_blocking(move || decode_image(&bytes))
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{image_path}: {e}")))
}

fn fault_reply(fault: Fault) -> zbus::fdo::Error {
    tracing::warn!(operation = fault.operation(), error = %fault, "request failed");
    zbus::fdo::Error::Failed(fault.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.RollCall1")]
impl RollCallService {
    /// Resolve an image to an identity without recording anything.
    async fn match_probe(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "match_probe requested");
        let probe = load_probe(image_path).await?;
        let verdict = self.log.kiosk().match_probe(&probe).await.map_err(fault_reply)?;
        to_json(&verdict)
    }

    /// Match an image and record the attendance outcome at the current time.
    async fn check_in(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "check_in requested");
        let probe = load_probe(image_path).await?;
        let now = chrono::Local::now().naive_local();
        let outcome = self
            .log
            .kiosk()
            .check_in(&probe, now, &CancellationToken::new())
            .await
            .map_err(fault_reply)?
            .ok_or_else(|| zbus::fdo::Error::Failed("check-in cancelled".into()))?;
        self.log.record(&outcome);
        to_json(&outcome)
    }

    /// Stop live sampling. Returns false if already paused.
    async fn pause(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("pause requested");
        self.sampler()?
            .pause()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Restart live sampling. Returns false if it was not paused.
    async fn resume(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("resume requested");
        self.sampler()?
            .resume()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Rebuild the candidate index from the record store.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload requested");
        let count = self.log.kiosk().reload().await.map_err(fault_reply)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let sampler = match &self.sampler {
            Some(handle) => Some(
                handle
                    .status()
                    .await
                    .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?,
            ),
            None => None,
        };
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities_indexed": self.log.kiosk().index().len(),
            "sampler": sampler,
            "last_outcome": self.log.last(),
        }))
    }
}
