//! Kiosk facade.
//!
//! Owns one index, matcher and ledger over a shared record store and
//! descriptor oracle. Everything is constructed explicitly so tests and
//! daemons get isolated instances.

use crate::config::KioskConfig;
use crate::error::Fault;
use crate::index::SignatureIndex;
use crate::ledger::AttendanceLedger;
use crate::matcher::DescriptorMatcher;
use crate::oracle::DescriptorOracle;
use crate::stability::ProbeHandler;
use crate::store::RecordStore;
use crate::types::{AttendanceOutcome, Identity, IdentityId, MatchVerdict};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use image::DynamicImage;
use rollcall_capture::Frame;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Kiosk {
    store: Arc<dyn RecordStore>,
    index: SignatureIndex,
    matcher: DescriptorMatcher,
    ledger: AttendanceLedger,
    shortlist_size: usize,
}

impl Kiosk {
    pub fn new(store: Arc<dyn RecordStore>, oracle: Arc<dyn DescriptorOracle>, config: &KioskConfig) -> Self {
        Self {
            index: SignatureIndex::new(Arc::clone(&store), config.index.clone()),
            matcher: DescriptorMatcher::new(oracle, Arc::clone(&store), config.matcher.clone()),
            ledger: AttendanceLedger::new(Arc::clone(&store), &config.attendance),
            shortlist_size: config.matcher.shortlist_size,
            store,
        }
    }

    pub fn index(&self) -> &SignatureIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Shortlist by signature, then resolve by descriptor distance.
    pub async fn match_probe(&self, probe: &DynamicImage) -> Result<MatchVerdict, Fault> {
        let shortlist = self.index.shortlist(probe, self.shortlist_size).await?;
        self.matcher.match_probe(probe, &shortlist).await
    }

    pub async fn record_attendance(
        &self,
        verdict: &MatchVerdict,
        now: NaiveDateTime,
    ) -> Result<AttendanceOutcome, Fault> {
        self.ledger.record(verdict, now).await
    }

    /// Match and record in one step.
    ///
    /// Returns `Ok(None)` without recording anything if `cancel` fires
    /// before the verdict is handed to the ledger.
    pub async fn check_in(
        &self,
        probe: &DynamicImage,
        now: NaiveDateTime,
        cancel: &CancellationToken,
    ) -> Result<Option<AttendanceOutcome>, Fault> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let verdict = self.match_probe(probe).await?;
        if cancel.is_cancelled() {
            tracing::debug!(?verdict, "check-in cancelled; verdict discarded");
            return Ok(None);
        }
        self.record_attendance(&verdict, now).await.map(Some)
    }

    pub async fn find_identity(&self, external_user_id: &str) -> Result<Option<Identity>, Fault> {
        self.store
            .find_identity_by_user_id(external_user_id)
            .await
            .map_err(|e| Fault::store("find_identity_by_user_id", e))
    }

    /// Rebuild the candidate set from the store. Identities still enrolled
    /// keep their computed signature and descriptor.
    pub async fn reload(&self) -> Result<usize, Fault> {
        self.index.invalidate();
        Ok(self.index.build().await?.len())
    }

    /// Evict a removed identity without a full rebuild.
    pub fn forget(&self, identity_id: IdentityId) {
        self.index.forget(identity_id);
    }
}

#[async_trait]
impl ProbeHandler for Kiosk {
    async fn handle_probe(
        &self,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> Result<Option<AttendanceOutcome>, Fault> {
        let now = Local::now().naive_local();
        tracing::debug!(sequence = frame.sequence, "probe handed off");
        self.check_in(&frame.image, now, cancel).await
    }
}
