//! Attendance sequencing.
//!
//! Turns a match verdict and the current kiosk-local time into exactly one
//! outcome. Resolution failures are always recorded; policy rejections
//! (`DAY_COMPLETED`, `TOO_SOON`) are computed from today's SUCCESS events and
//! never write anything.

use crate::config::AttendanceConfig;
use crate::error::Fault;
use crate::store::RecordStore;
use crate::types::{
    AttendanceEvent, AttendanceOutcome, AttendanceStatus, CheckType, EventResult, FailureReason,
    Identity, MatchVerdict,
};
use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One IN and one OUT per identity per day.
pub const MAX_SUCCESS_EVENTS_PER_DAY: usize = 2;

/// Check type, status and schedule for an accepted SUCCESS event.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub check_type: CheckType,
    pub status: AttendanceStatus,
    pub late_minutes: u32,
    pub scheduled_start: Option<NaiveDateTime>,
    pub scheduled_end: Option<NaiveDateTime>,
}

/// Decide the next SUCCESS event for `identity` given today's prior SUCCESS
/// events, or the policy rejection that suppresses it.
pub fn assess(
    identity: &Identity,
    prior: &[AttendanceEvent],
    now: NaiveDateTime,
    min_gap: Duration,
) -> Result<Assessment, FailureReason> {
    if prior.len() >= MAX_SUCCESS_EVENTS_PER_DAY {
        return Err(FailureReason::DayCompleted);
    }

    let check_type = if prior.len() % 2 == 0 {
        CheckType::In
    } else {
        CheckType::Out
    };

    if let Some(last) = prior.iter().map(|e| e.event_time).max() {
        if now - last < min_gap {
            return Err(FailureReason::TooSoon);
        }
    }

    let today = now.date();
    let scheduled_start = identity.shift_start.map(|t| today.and_time(t));
    let scheduled_end = identity.shift_end.map(|t| today.and_time(t));

    let (status, late_minutes) = match (check_type, scheduled_start, scheduled_end) {
        (CheckType::In, Some(start), _) => {
            let latest_on_time = start + Duration::minutes(i64::from(identity.grace_minutes));
            if now > latest_on_time {
                (AttendanceStatus::Late, rounded_minutes(now - latest_on_time))
            } else {
                (AttendanceStatus::OnTime, 0)
            }
        }
        (CheckType::Out, _, Some(end)) if now < end => (AttendanceStatus::Early, 0),
        _ => (AttendanceStatus::OnTime, 0),
    };

    Ok(Assessment {
        check_type,
        status,
        late_minutes,
        scheduled_start,
        scheduled_end,
    })
}

/// Nearest whole minute of a non-negative span, half a minute rounding up.
fn rounded_minutes(span: Duration) -> u32 {
    let ms = span.num_milliseconds().max(0);
    u32::try_from((ms + 30_000) / 60_000).unwrap_or(u32::MAX)
}

pub struct AttendanceLedger {
    store: Arc<dyn RecordStore>,
    min_gap: Duration,
    /// Serializes read-decide-write so two probes for the same person cannot
    /// both see an empty day.
    serial: Mutex<()>,
}

impl AttendanceLedger {
    pub fn new(store: Arc<dyn RecordStore>, config: &AttendanceConfig) -> Self {
        Self {
            store,
            min_gap: Duration::seconds(config.min_gap_secs),
            serial: Mutex::new(()),
        }
    }

    pub async fn record(&self, verdict: &MatchVerdict, now: NaiveDateTime) -> Result<AttendanceOutcome, Fault> {
        let (identity, similarity) = match verdict {
            MatchVerdict::Match { identity, similarity } => (identity, *similarity),
            MatchVerdict::NoMatch { similarity } => {
                return self
                    .record_unresolved(EventResult::NoMatch, FailureReason::NoMatch, Some(*similarity), now)
                    .await;
            }
            MatchVerdict::NoFace => {
                return self
                    .record_unresolved(EventResult::NoFace, FailureReason::NoFace, None, now)
                    .await;
            }
            MatchVerdict::MultipleFaces { .. } => {
                return self
                    .record_unresolved(EventResult::MultipleFaces, FailureReason::MultipleFaces, None, now)
                    .await;
            }
        };

        let _serial = self.serial.lock().await;

        let prior = self
            .store
            .list_success_events_for_identity_on_date(identity.id, now.date())
            .await
            .map_err(|e| Fault::store("list_success_events_for_identity_on_date", e))?;

        let assessment = match assess(identity, &prior, now, self.min_gap) {
            Ok(assessment) => assessment,
            Err(reason) => {
                tracing::info!(
                    identity = %identity.id,
                    user = %identity.external_user_id,
                    prior = prior.len(),
                    reason = %reason,
                    "attendance rejected"
                );
                return Ok(AttendanceOutcome::Failure {
                    reason,
                    similarity: Some(similarity),
                });
            }
        };

        let event = AttendanceEvent {
            identity_id: Some(identity.id),
            result: EventResult::Success,
            similarity: Some(similarity),
            check_type: Some(assessment.check_type),
            status: Some(assessment.status),
            late_minutes: Some(assessment.late_minutes),
            scheduled_start: assessment.scheduled_start,
            scheduled_end: assessment.scheduled_end,
            event_time: now,
        };
        let event_id = self
            .store
            .create_attendance_event(&event)
            .await
            .map_err(|e| Fault::store("create_attendance_event", e))?;

        tracing::info!(
            event = %event_id,
            identity = %identity.id,
            user = %identity.external_user_id,
            check_type = %assessment.check_type,
            status = %assessment.status,
            late_minutes = assessment.late_minutes,
            similarity,
            "attendance recorded"
        );

        Ok(AttendanceOutcome::Success {
            identity: identity.clone(),
            check_type: assessment.check_type,
            status: assessment.status,
            late_minutes: assessment.late_minutes,
            similarity,
            scheduled_start: assessment.scheduled_start,
            scheduled_end: assessment.scheduled_end,
            event_time: now,
        })
    }

    async fn record_unresolved(
        &self,
        result: EventResult,
        reason: FailureReason,
        similarity: Option<f32>,
        now: NaiveDateTime,
    ) -> Result<AttendanceOutcome, Fault> {
        let event = AttendanceEvent::unresolved(result, similarity, now);
        self.store
            .create_attendance_event(&event)
            .await
            .map_err(|e| Fault::store("create_attendance_event", e))?;
        tracing::info!(result = %result, ?similarity, "unresolved attempt recorded");
        Ok(AttendanceOutcome::Failure { reason, similarity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewIdentity};
    use chrono::{NaiveDate, NaiveTime};

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn setup(shift: Option<(NaiveTime, NaiveTime, u32)>) -> (Arc<MemoryStore>, AttendanceLedger, Identity) {
        let store = Arc::new(MemoryStore::new());
        let mut new = NewIdentity::new("E042", "Grace Hopper");
        if let Some((start, end, grace)) = shift {
            new = new.with_shift(Some(start), Some(end), grace);
        }
        let identity = store.enroll(new, vec![1, 2, 3]).unwrap();
        let ledger = AttendanceLedger::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            &AttendanceConfig::default(),
        );
        (store, ledger, identity)
    }

    fn matched(identity: &Identity) -> MatchVerdict {
        MatchVerdict::Match {
            identity: identity.clone(),
            similarity: 0.8,
        }
    }

    fn prior_at(identity: &Identity, time: NaiveDateTime) -> AttendanceEvent {
        AttendanceEvent {
            identity_id: Some(identity.id),
            result: EventResult::Success,
            similarity: Some(0.9),
            check_type: None,
            status: None,
            late_minutes: None,
            scheduled_start: None,
            scheduled_end: None,
            event_time: time,
        }
    }

    fn success_fields(outcome: &AttendanceOutcome) -> (CheckType, AttendanceStatus, u32) {
        match outcome {
            AttendanceOutcome::Success {
                check_type,
                status,
                late_minutes,
                ..
            } => (*check_type, *status, *late_minutes),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_success_is_in_then_out() {
        let (store, ledger, identity) = setup(None);

        let first = ledger.record(&matched(&identity), at(8, 0)).await.unwrap();
        assert_eq!(success_fields(&first), (CheckType::In, AttendanceStatus::OnTime, 0));

        let second = ledger.record(&matched(&identity), at(16, 0)).await.unwrap();
        assert_eq!(success_fields(&second).0, CheckType::Out);
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn test_too_soon_creates_no_event() {
        let (store, ledger, identity) = setup(None);
        ledger.record(&matched(&identity), at(8, 0)).await.unwrap();

        let outcome = ledger.record(&matched(&identity), at(8, 1)).await.unwrap();
        assert_eq!(
            outcome,
            AttendanceOutcome::Failure {
                reason: FailureReason::TooSoon,
                similarity: Some(0.8)
            }
        );
        assert_eq!(store.events().len(), 1);

        let later = ledger.record(&matched(&identity), at(8, 2)).await.unwrap();
        assert_eq!(success_fields(&later).0, CheckType::Out, "exactly the gap is enough");
    }

    #[tokio::test]
    async fn test_day_completed_after_two_successes() {
        let (store, ledger, identity) = setup(None);
        ledger.record(&matched(&identity), at(8, 0)).await.unwrap();
        ledger.record(&matched(&identity), at(17, 0)).await.unwrap();

        let outcome = ledger.record(&matched(&identity), at(18, 0)).await.unwrap();
        assert!(matches!(
            outcome,
            AttendanceOutcome::Failure {
                reason: FailureReason::DayCompleted,
                ..
            }
        ));
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn test_new_day_starts_with_in() {
        let (_, ledger, identity) = setup(None);
        ledger.record(&matched(&identity), at(8, 0)).await.unwrap();
        ledger.record(&matched(&identity), at(17, 0)).await.unwrap();

        let tomorrow = at(8, 0) + Duration::days(1);
        let outcome = ledger.record(&matched(&identity), tomorrow).await.unwrap();
        assert_eq!(success_fields(&outcome).0, CheckType::In);
    }

    #[tokio::test]
    async fn test_grace_period_boundary() {
        let (_, ledger, identity) = setup(Some((hm(9, 0), hm(18, 0), 10)));
        let outcome = ledger.record(&matched(&identity), at(9, 9)).await.unwrap();
        assert_eq!(success_fields(&outcome), (CheckType::In, AttendanceStatus::OnTime, 0));

        let (_, ledger, identity) = setup(Some((hm(9, 0), hm(18, 0), 10)));
        let outcome = ledger.record(&matched(&identity), at(9, 11)).await.unwrap();
        assert_eq!(success_fields(&outcome), (CheckType::In, AttendanceStatus::Late, 1));
    }

    #[tokio::test]
    async fn test_success_carries_schedule() {
        let (_, ledger, identity) = setup(Some((hm(9, 0), hm(18, 0), 10)));
        match ledger.record(&matched(&identity), at(9, 30)).await.unwrap() {
            AttendanceOutcome::Success {
                scheduled_start,
                scheduled_end,
                late_minutes,
                event_time,
                ..
            } => {
                assert_eq!(scheduled_start, Some(at(9, 0)));
                assert_eq!(scheduled_end, Some(at(18, 0)));
                assert_eq!(late_minutes, 20);
                assert_eq!(event_time, at(9, 30));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_early_and_on_time_checkout() {
        let identity = NewIdentity::new("E1", "x")
            .with_shift(Some(hm(9, 0)), Some(hm(18, 0)), 0)
            .into_identity();
        let prior = [prior_at(&identity, at(9, 0))];
        let gap = Duration::minutes(2);

        let early = assess(&identity, &prior, at(17, 45), gap).unwrap();
        assert_eq!((early.check_type, early.status), (CheckType::Out, AttendanceStatus::Early));

        let on_time = assess(&identity, &prior, at(18, 5), gap).unwrap();
        assert_eq!((on_time.check_type, on_time.status), (CheckType::Out, AttendanceStatus::OnTime));
    }

    #[test]
    fn test_late_minutes_round_to_nearest() {
        let identity = NewIdentity::new("E1", "x")
            .with_shift(Some(hm(9, 0)), None, 0)
            .into_identity();
        let gap = Duration::minutes(2);
        let base = at(9, 0);

        let a = assess(&identity, &[], base + Duration::seconds(89), gap).unwrap();
        assert_eq!((a.status, a.late_minutes), (AttendanceStatus::Late, 1));

        let b = assess(&identity, &[], base + Duration::seconds(90), gap).unwrap();
        assert_eq!(b.late_minutes, 2);

        let c = assess(&identity, &[], base, gap).unwrap();
        assert_eq!(c.status, AttendanceStatus::OnTime);
    }

    #[test]
    fn test_no_schedule_is_on_time() {
        let identity = NewIdentity::new("E1", "x").into_identity();
        let gap = Duration::minutes(2);

        let check_in = assess(&identity, &[], at(23, 0), gap).unwrap();
        assert_eq!(check_in.status, AttendanceStatus::OnTime);
        assert_eq!(check_in.scheduled_start, None);

        let check_out = assess(&identity, &[prior_at(&identity, at(6, 0))], at(7, 0), gap).unwrap();
        assert_eq!(check_out.status, AttendanceStatus::OnTime);
    }

    #[test]
    fn test_gap_is_strict() {
        let identity = NewIdentity::new("E1", "x").into_identity();
        let prior = [prior_at(&identity, at(10, 0))];
        let gap = Duration::minutes(2);
        assert_eq!(
            assess(&identity, &prior, at(10, 1), gap),
            Err(FailureReason::TooSoon)
        );
    }

    #[tokio::test]
    async fn test_resolution_failures_are_recorded() {
        let (store, ledger, _) = setup(None);

        let no_match = ledger
            .record(&MatchVerdict::NoMatch { similarity: 0.3 }, at(8, 0))
            .await
            .unwrap();
        assert_eq!(
            no_match,
            AttendanceOutcome::Failure {
                reason: FailureReason::NoMatch,
                similarity: Some(0.3)
            }
        );

        let no_face = ledger.record(&MatchVerdict::NoFace, at(8, 0)).await.unwrap();
        assert_eq!(
            no_face,
            AttendanceOutcome::Failure {
                reason: FailureReason::NoFace,
                similarity: None
            }
        );

        ledger
            .record(&MatchVerdict::MultipleFaces { count: 3 }, at(8, 0))
            .await
            .unwrap();

        let events = store.events();
        let results: Vec<_> = events.iter().map(|e| e.result).collect();
        assert_eq!(
            results,
            vec![EventResult::NoMatch, EventResult::NoFace, EventResult::MultipleFaces]
        );
        assert!(events.iter().all(|e| e.identity_id.is_none() && e.check_type.is_none()));
    }

    #[tokio::test]
    async fn test_failed_attempts_do_not_count_toward_the_day() {
        let (_, ledger, identity) = setup(None);
        ledger.record(&MatchVerdict::NoFace, at(7, 0)).await.unwrap();
        ledger
            .record(&MatchVerdict::NoMatch { similarity: 0.1 }, at(7, 1))
            .await
            .unwrap();

        let outcome = ledger.record(&matched(&identity), at(7, 2)).await.unwrap();
        assert_eq!(success_fields(&outcome).0, CheckType::In);
    }

    #[tokio::test]
    async fn test_concurrent_records_never_double_check_in() {
        let (store, ledger, identity) = setup(None);
        let ledger = Arc::new(ledger);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let ledger = Arc::clone(&ledger);
            let verdict = matched(&identity);
            tasks.push(tokio::spawn(async move { ledger.record(&verdict, at(8, 0)).await }));
        }
        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_success() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(store.events().len(), 1);
    }
}
