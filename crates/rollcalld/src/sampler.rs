use async_trait::async_trait;
use rollcall_capture::{CaptureError, DirectorySource, Frame};
use rollcall_core::stability::{ProbeHandler, RunSummary, StabilityDetector};
use rollcall_core::{AttendanceOutcome, Fault, Kiosk};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Delay before restarting a loop that stopped on a capture error. Doubles
/// on each consecutive failure up to [`MAX_RESTART_DELAY`].
const MIN_RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("sampler task exited")]
    ChannelClosed,
}

/// The kiosk plus the most recent attendance outcome, for status reports.
pub struct OutcomeLog {
    kiosk: Arc<Kiosk>,
    last: Mutex<Option<AttendanceOutcome>>,
}

impl OutcomeLog {
    pub fn new(kiosk: Arc<Kiosk>) -> Self {
        Self {
            kiosk,
            last: Mutex::new(None),
        }
    }

    pub fn kiosk(&self) -> &Kiosk {
        &self.kiosk
    }

    pub fn record(&self, outcome: &AttendanceOutcome) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
    }

    pub fn last(&self) -> Option<AttendanceOutcome> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ProbeHandler for OutcomeLog {
    async fn handle_probe(
        &self,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> Result<Option<AttendanceOutcome>, Fault> {
        let outcome = self.kiosk.handle_probe(frame, cancel).await?;
        if let Some(outcome) = &outcome {
            self.record(outcome);
        }
        Ok(outcome)
    }
}

/// Snapshot of the sampling loop, totals across every run since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplerStatus {
    pub running: bool,
    pub paused: bool,
    pub frames: u64,
    pub triggers: u64,
    pub faults: u64,
    /// Loops restarted after a capture error.
    pub restarts: u64,
    pub last_error: Option<String>,
}

/// Messages sent from D-Bus handlers to the sampler task.
enum SamplerRequest {
    Pause { reply: oneshot::Sender<bool> },
    Resume { reply: oneshot::Sender<bool> },
    Status { reply: oneshot::Sender<SamplerStatus> },
}

/// Clone-safe handle to the sampler task.
#[derive(Clone)]
pub struct SamplerHandle {
    tx: mpsc::Sender<SamplerRequest>,
}

impl SamplerHandle {
    /// Cancel the running loop. `false` if it was already paused.
    pub async fn pause(&self) -> Result<bool, SamplerError> {
        self.request(|reply| SamplerRequest::Pause { reply }).await
    }

    /// Start a fresh loop. `false` if one is already running.
    pub async fn resume(&self) -> Result<bool, SamplerError> {
        self.request(|reply| SamplerRequest::Resume { reply }).await
    }

    pub async fn status(&self) -> Result<SamplerStatus, SamplerError> {
        self.request(|reply| SamplerRequest::Status { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SamplerRequest,
    ) -> Result<T, SamplerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SamplerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SamplerError::ChannelClosed)
    }
}

type RunResult = (StabilityDetector, DirectorySource, Result<RunSummary, CaptureError>);

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<RunResult>,
    started: Instant,
}

struct Supervisor {
    log: Arc<OutcomeLog>,
    /// Detector and source between runs; `None` while a run owns them.
    parked: Option<(StabilityDetector, DirectorySource)>,
    running: Option<Running>,
    /// When to restart a loop that stopped on its own.
    retry_at: Option<Instant>,
    restart_delay: Duration,
    status: SamplerStatus,
}

impl Supervisor {
    fn start(&mut self) -> bool {
        let Some((mut detector, mut source)) = self.parked.take() else {
            tracing::warn!("sampling loop cannot be restarted");
            return false;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let log = Arc::clone(&self.log);
        let task = tokio::spawn(async move {
            // Frames spooled while paused are stale.
            if let Err(e) = source.skip_backlog().await {
                return (detector, source, Err(e));
            }
            detector.reset();
            let result = detector.run(&mut source, log.as_ref(), &token).await;
            (detector, source, result)
        });

        self.running = Some(Running {
            cancel,
            task,
            started: Instant::now(),
        });
        self.status.running = true;
        tracing::info!("sampling started");
        true
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let joined = running.task.await;
            self.collect(joined, running.started);
        }
    }

    fn collect(&mut self, joined: Result<RunResult, JoinError>, started: Instant) {
        self.status.running = false;
        match joined {
            Ok((detector, source, result)) => {
                match result {
                    Ok(summary) => {
                        self.status.frames += summary.frames;
                        self.status.triggers += summary.triggers;
                        self.status.faults += summary.faults;
                        tracing::info!(
                            frames = summary.frames,
                            triggers = summary.triggers,
                            outcomes = summary.outcomes,
                            "sampling stopped"
                        );
                    }
                    Err(e) => {
                        self.status.last_error = Some(e.to_string());
                        if !self.status.paused {
                            self.schedule_restart(started.elapsed());
                        }
                        tracing::warn!(error = %e, "sampling loop failed");
                    }
                }
                self.parked = Some((detector, source));
            }
            Err(e) => tracing::error!(error = %e, "sampling task aborted"),
        }
    }

    fn schedule_restart(&mut self, ran_for: Duration) {
        if ran_for >= MAX_RESTART_DELAY {
            self.restart_delay = MIN_RESTART_DELAY;
        }
        self.retry_at = Some(Instant::now() + self.restart_delay);
        tracing::info!(delay_ms = self.restart_delay.as_millis() as u64, "sampling restart scheduled");
        self.restart_delay = (self.restart_delay * 2).min(MAX_RESTART_DELAY);
    }

    fn restart(&mut self) {
        self.retry_at = None;
        if self.start() {
            self.status.restarts += 1;
        }
    }

    async fn handle(&mut self, request: SamplerRequest) {
        match request {
            SamplerRequest::Pause { reply } => {
                let changed = !self.status.paused;
                self.status.paused = true;
                self.retry_at = None;
                self.stop().await;
                let _ = reply.send(changed);
            }
            SamplerRequest::Resume { reply } => {
                let changed = self.running.is_none() && self.start();
                if changed {
                    self.status.paused = false;
                    self.retry_at = None;
                    self.restart_delay = MIN_RESTART_DELAY;
                }
                let _ = reply.send(changed);
            }
            SamplerRequest::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
        }
    }
}

async fn finished(running: &mut Option<Running>) -> (Result<RunResult, JoinError>, Instant) {
    match running {
        Some(running) => ((&mut running.task).await, running.started),
        None => std::future::pending().await,
    }
}

async fn restart_due(retry_at: Option<Instant>) {
    match retry_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Spawn the sampler supervisor.
///
/// The supervisor owns the detector and frame source and runs the sampling
/// loop as a child task with its own cancellation token, so Pause takes
/// effect before the next sample. A loop that stops on a capture error is
/// restarted with backoff unless sampling is paused. It exits when
/// `shutdown` fires.
pub fn spawn_sampler(
    log: Arc<OutcomeLog>,
    detector: StabilityDetector,
    source: DirectorySource,
    start_paused: bool,
    shutdown: CancellationToken,
) -> (SamplerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SamplerRequest>(8);

    let mut supervisor = Supervisor {
        log,
        parked: Some((detector, source)),
        running: None,
        retry_at: None,
        restart_delay: MIN_RESTART_DELAY,
        status: SamplerStatus {
            paused: start_paused,
            ..SamplerStatus::default()
        },
    };

    let task = tokio::spawn(async move {
        if !start_paused {
            supervisor.start();
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => supervisor.handle(request).await,
                    None => break,
                },
                (joined, started) = finished(&mut supervisor.running) => {
                    supervisor.running = None;
                    supervisor.collect(joined, started);
                }
                _ = restart_due(supervisor.retry_at) => supervisor.restart(),
            }
        }
        supervisor.stop().await;
        tracing::info!("sampler exiting");
    });

    (SamplerHandle { tx }, task)
}
