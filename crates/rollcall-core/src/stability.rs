//! Stability detection over a live frame stream.
//!
//! Decides the instant a frame is settled enough to be handed to the matcher,
//! using only the cheap coarse signature of each frame. Transitions are driven
//! by frame-to-frame similarity and presence; the only wall-clock input is the
//! cooldown timer.

use crate::config::StabilityConfig;
use crate::error::Fault;
use crate::signature::{Signature, DEFAULT_SIGNATURE_SIDE};
use crate::types::AttendanceOutcome;
use async_trait::async_trait;
use rollcall_capture::{CaptureError, Frame, FrameSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Nobody in front of the camera.
    Idle,
    /// A subject just appeared; the lower frame requirement and the fast path apply.
    Entering,
    /// A subject is present and settling.
    Stabilizing,
    /// A probe was just handed off; no triggers until the timer expires.
    Cooldown,
}

/// What the detector concluded about one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameVerdict {
    /// Dark or low-contrast frame; state was reset.
    Empty,
    CoolingDown,
    /// Similarity to the previous frame fell below the movement threshold.
    Motion { similarity: f32 },
    /// Present but not yet stable. `similarity` is `None` on the first frame.
    Settling {
        similarity: Option<f32>,
        stable_count: u32,
    },
    /// Emit this frame as the probe.
    Trigger { similarity: f32, fast_path: bool },
}

pub struct StabilityDetector {
    config: StabilityConfig,
    signature_side: u32,
    previous: Option<Signature>,
    stable_count: u32,
    previously_present: bool,
    entering: bool,
    last_trigger: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl StabilityDetector {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            signature_side: DEFAULT_SIGNATURE_SIDE,
            previous: None,
            stable_count: 0,
            previously_present: false,
            entering: false,
            last_trigger: None,
            cooldown_until: None,
        }
    }

    pub fn with_signature_side(mut self, side: u32) -> Self {
        self.signature_side = side;
        self
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    pub fn last_trigger(&self) -> Option<Instant> {
        self.last_trigger
    }

    pub fn state(&self, now: Instant) -> DetectorState {
        if self.cooling_down(now) {
            DetectorState::Cooldown
        } else if !self.previously_present {
            DetectorState::Idle
        } else if self.entering {
            DetectorState::Entering
        } else {
            DetectorState::Stabilizing
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Feed one frame's signature through the state machine.
    pub fn observe(&mut self, signature: &Signature, is_dark: bool, now: Instant) -> FrameVerdict {
        let present = !is_dark && signature.variance() >= self.config.min_presence_variance;
        if !present {
            if self.previously_present {
                tracing::debug!("subject left");
            }
            self.previous = None;
            self.stable_count = 0;
            self.previously_present = false;
            self.entering = false;
            return if self.cooling_down(now) {
                FrameVerdict::CoolingDown
            } else {
                FrameVerdict::Empty
            };
        }

        if !self.previously_present {
            tracing::debug!("subject entering");
            self.entering = true;
            self.stable_count = 0;
        }

        let similarity = self.previous.as_ref().map(|prev| signature.similarity(prev));
        match similarity {
            Some(s) if s > self.config.stability_threshold => self.stable_count += 1,
            _ => self.stable_count = 0,
        }

        self.previous = Some(signature.clone());
        self.previously_present = true;

        if self.cooling_down(now) {
            self.stable_count = 0;
            return FrameVerdict::CoolingDown;
        }

        let Some(similarity) = similarity else {
            return FrameVerdict::Settling {
                similarity: None,
                stable_count: 0,
            };
        };

        if similarity < self.config.movement_threshold {
            return FrameVerdict::Motion { similarity };
        }

        let fast_path = self.entering && similarity > self.config.fast_path_threshold;
        let required = if self.entering {
            self.config.entering_frames
        } else {
            self.config.steady_frames
        };

        if fast_path || self.stable_count >= required {
            tracing::debug!(similarity, fast_path, stable = self.stable_count, "probe triggered");
            self.last_trigger = Some(now);
            self.cooldown_until = Some(now + self.cooldown());
            self.stable_count = 0;
            self.entering = false;
            return FrameVerdict::Trigger { similarity, fast_path };
        }

        FrameVerdict::Settling {
            similarity: Some(similarity),
            stable_count: self.stable_count,
        }
    }

    /// Restart the cooldown once the hand-off for a triggered probe completes.
    pub fn complete_handoff(&mut self, now: Instant) {
        self.cooldown_until = Some(now + self.cooldown());
        self.stable_count = 0;
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.stable_count = 0;
        self.previously_present = false;
        self.entering = false;
        self.cooldown_until = None;
    }

    /// Sample `source` until it is exhausted or `cancel` fires.
    ///
    /// Frames are processed strictly one at a time and the handler is awaited
    /// before the next sample. Cancellation is honoured while waiting for a
    /// frame and during the inter-sample sleep; a hand-off that completes
    /// after cancellation has its result discarded.
    pub async fn run<S, H>(
        &mut self,
        source: &mut S,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, CaptureError>
    where
        S: FrameSource + ?Sized,
        H: ProbeHandler + ?Sized,
    {
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        let mut summary = RunSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = source.next_frame() => next?,
            };
            let Some(frame) = next else {
                tracing::info!(frames = summary.frames, "frame source exhausted");
                break;
            };
            summary.frames += 1;

            let image = Arc::clone(&frame.image);
            let side = self.signature_side;
            let signature = tokio::task::spawn_blocking(move || Signature::from_image(&image, side))
                .await
                .map_err(|e| CaptureError::Worker(e.to_string()))?;

            let verdict = self.observe(&signature, frame.is_dark, Instant::now());
            tracing::trace!(sequence = frame.sequence, ?verdict, "frame observed");

            if let FrameVerdict::Trigger { .. } = verdict {
                summary.triggers += 1;
                let sequence = frame.sequence;
                let result = handler.handle_probe(frame, cancel).await;
                if cancel.is_cancelled() {
                    tracing::debug!(sequence, "cancelled during hand-off; result discarded");
                    break;
                }
                match result {
                    Ok(Some(outcome)) => {
                        summary.outcomes += 1;
                        if outcome.is_success() {
                            summary.successes += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(fault) => {
                        tracing::warn!(operation = fault.operation(), error = %fault, "probe hand-off failed");
                        summary.faults += 1;
                    }
                }
                self.complete_handoff(Instant::now());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        Ok(summary)
    }
}

/// Receives triggered probes from [`StabilityDetector::run`].
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    /// `Ok(None)` when the handler itself dropped the probe.
    async fn handle_probe(
        &self,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> Result<Option<AttendanceOutcome>, Fault>;
}

/// Counters for one call to [`StabilityDetector::run`]. Outcomes themselves
/// go to the [`ProbeHandler`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub triggers: u64,
    /// Hand-offs that produced an attendance outcome.
    pub outcomes: u64,
    pub successes: u64,
    pub faults: u64,
}
