//! Descriptor matcher.
//!
//! Resolves a probe image to at most one shortlisted identity. The decision
//! is made on Euclidean descriptor distance; similarity (`1 - distance`,
//! floored at 0) is only reported for display and diagnostics.

use crate::config::MatcherConfig;
use crate::error::{Fault, StoreError};
use crate::index::{Candidate, ShortlistEntry};
use crate::oracle::DescriptorOracle;
use crate::store::RecordStore;
use crate::types::{distance_to_similarity, Descriptor, Identity, MatchVerdict};
use image::DynamicImage;
use rollcall_capture::decode_image;
use std::sync::Arc;

pub struct DescriptorMatcher {
    oracle: Arc<dyn DescriptorOracle>,
    store: Arc<dyn RecordStore>,
    config: MatcherConfig,
}

impl DescriptorMatcher {
    pub fn new(
        oracle: Arc<dyn DescriptorOracle>,
        store: Arc<dyn RecordStore>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            oracle,
            store,
            config,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Compare the probe against the shortlist, in shortlist order.
    ///
    /// Equal minimum distances resolve to the first candidate encountered.
    /// Candidates whose reference image yields no descriptor are skipped.
    pub async fn match_probe(
        &self,
        probe: &DynamicImage,
        shortlist: &[ShortlistEntry],
    ) -> Result<MatchVerdict, Fault> {
        let extraction = self
            .oracle
            .extract(probe)
            .await
            .map_err(|e| Fault::oracle("extract_descriptor", e))?;

        let Some(extraction) = extraction else {
            tracing::debug!("no face in probe");
            return Ok(MatchVerdict::NoFace);
        };

        if extraction.face_count > 1 && self.config.reject_multiple_faces {
            tracing::debug!(faces = extraction.face_count, "multiple faces in probe");
            return Ok(MatchVerdict::MultipleFaces {
                count: extraction.face_count,
            });
        }

        let probe_descriptor = extraction.descriptor;
        let mut best: Option<(&Identity, f32)> = None;

        for entry in shortlist {
            let candidate = &entry.candidate;
            let Some(descriptor) = self.candidate_descriptor(candidate).await? else {
                continue;
            };
            if descriptor.values.len() != probe_descriptor.values.len() {
                tracing::warn!(
                    identity = %candidate.identity.id,
                    probe_dim = probe_descriptor.values.len(),
                    candidate_dim = descriptor.values.len(),
                    "descriptor dimension mismatch; candidate skipped"
                );
                continue;
            }

            let distance = probe_descriptor.euclidean_distance(&descriptor);
            if !distance.is_finite() {
                tracing::warn!(identity = %candidate.identity.id, distance, "non-finite descriptor distance; candidate skipped");
                continue;
            }
            tracing::trace!(identity = %candidate.identity.id, distance, "candidate compared");
            if best.map_or(true, |(_, min)| distance < min) {
                best = Some((&candidate.identity, distance));
            }
        }

        let verdict = match best {
            Some((identity, distance)) if distance <= self.config.distance_threshold => {
                tracing::info!(
                    identity = %identity.id,
                    user = %identity.external_user_id,
                    distance,
                    "probe matched"
                );
                MatchVerdict::Match {
                    identity: identity.clone(),
                    similarity: distance_to_similarity(distance),
                }
            }
            Some((_, distance)) => {
                tracing::info!(distance, threshold = self.config.distance_threshold, "no match");
                MatchVerdict::NoMatch {
                    similarity: distance_to_similarity(distance),
                }
            }
            None => MatchVerdict::NoMatch { similarity: 0.0 },
        };
        Ok(verdict)
    }

    async fn candidate_descriptor(&self, candidate: &Candidate) -> Result<Option<Descriptor>, Fault> {
        if !self.config.cache_descriptors {
            return self.reference_descriptor(&candidate.identity).await;
        }
        let cell = candidate
            .descriptor
            .get_or_try_init(|| self.reference_descriptor(&candidate.identity))
            .await?;
        Ok(cell.clone())
    }

    /// Descriptor of the face in an identity's reference image, if any.
    async fn reference_descriptor(&self, identity: &Identity) -> Result<Option<Descriptor>, Fault> {
        let bytes = match self.store.get_reference_image(identity).await {
            Ok(bytes) => bytes,
            Err(StoreError::ReferenceImageMissing(id)) => {
                tracing::warn!(identity = %id, "reference image gone; skipping candidate");
                return Ok(None);
            }
            Err(e) => return Err(Fault::store("get_reference_image", e)),
        };

        let image = match tokio::task::spawn_blocking(move || decode_image(&bytes)).await {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                tracing::warn!(identity = %identity.id, error = %e, "undecodable reference image");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(identity = %identity.id, error = %e, "decode worker failed");
                return Ok(None);
            }
        };

        let extraction = self
            .oracle
            .extract(&image)
            .await
            .map_err(|e| Fault::oracle("extract_descriptor", e))?;

        match extraction {
            Some(extraction) => Ok(Some(extraction.descriptor)),
            None => {
                tracing::warn!(identity = %identity.id, "no face in reference image");
                Ok(None)
            }
        }
    }
}
