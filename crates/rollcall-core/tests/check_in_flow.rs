//! End-to-end check-in flow over the SQLite record store.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use image::{DynamicImage, GrayImage, Luma};
use rollcall_core::oracle::{DescriptorOracle, Extraction};
use rollcall_core::{
    AttendanceOutcome, AttendanceStatus, CheckType, Descriptor, EventResult, FailureReason, Kiosk,
    KioskConfig, MatchVerdict, NewIdentity, OracleError, RecordStore, SqliteStore,
};
use std::io::Cursor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Textured 64x64 image; the top-left pixel identifies the person in it.
fn portrait(person: u8, pattern: u32) -> DynamicImage {
    let mut gray = GrayImage::from_fn(64, 64, |x, y| {
        Luma([((x * (pattern + 2) + y * (pattern + 5)) % 180 + 40) as u8])
    });
    gray.put_pixel(0, 0, Luma([person]));
    DynamicImage::ImageLuma8(gray)
}

fn png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Each person id maps to a fixed unit descriptor; 0 means no face.
struct PixelOracle;

#[async_trait]
impl DescriptorOracle for PixelOracle {
    async fn extract(&self, image: &DynamicImage) -> Result<Option<Extraction>, OracleError> {
        let person = image.to_luma8().get_pixel(0, 0)[0];
        if person == 0 {
            return Ok(None);
        }
        let mut values = vec![0.0; 8];
        values[usize::from(person) % 8] = 1.0;
        Ok(Some(Extraction {
            descriptor: Descriptor::new(values),
            face_count: 1,
        }))
    }
}

fn day(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 9, 2)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

async fn setup() -> (Arc<SqliteStore>, Kiosk) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store
        .enroll(
            NewIdentity::new("E100", "Margaret Hamilton").with_shift(
                NaiveTime::from_hms_opt(9, 0, 0),
                NaiveTime::from_hms_opt(18, 0, 0),
                10,
            ),
            png(&portrait(1, 1)),
        )
        .await
        .unwrap();
    store
        .enroll(NewIdentity::new("E200", "Katherine Johnson"), png(&portrait(2, 6)))
        .await
        .unwrap();

    let kiosk = Kiosk::new(
        Arc::clone(&store) as Arc<dyn RecordStore>,
        Arc::new(PixelOracle),
        &KioskConfig::default(),
    );
    (store, kiosk)
}

async fn attempt(kiosk: &Kiosk, probe: &DynamicImage, now: NaiveDateTime) -> AttendanceOutcome {
    kiosk
        .check_in(probe, now, &CancellationToken::new())
        .await
        .unwrap()
        .expect("not cancelled")
}

#[tokio::test]
async fn full_working_day() {
    let (store, kiosk) = setup().await;
    let probe = portrait(1, 1);

    match attempt(&kiosk, &probe, day(9, 14)).await {
        AttendanceOutcome::Success {
            identity,
            check_type,
            status,
            late_minutes,
            similarity,
            ..
        } => {
            assert_eq!(identity.external_user_id, "E100");
            assert_eq!(check_type, CheckType::In);
            assert_eq!(status, AttendanceStatus::Late);
            assert_eq!(late_minutes, 4);
            assert!((similarity - 1.0).abs() < 1e-6);
        }
        other => panic!("expected check-in, got {other:?}"),
    }

    assert!(matches!(
        attempt(&kiosk, &probe, day(9, 15)).await,
        AttendanceOutcome::Failure {
            reason: FailureReason::TooSoon,
            ..
        }
    ));

    match attempt(&kiosk, &probe, day(17, 30)).await {
        AttendanceOutcome::Success { check_type, status, .. } => {
            assert_eq!((check_type, status), (CheckType::Out, AttendanceStatus::Early));
        }
        other => panic!("expected check-out, got {other:?}"),
    }

    assert!(matches!(
        attempt(&kiosk, &probe, day(18, 30)).await,
        AttendanceOutcome::Failure {
            reason: FailureReason::DayCompleted,
            ..
        }
    ));

    let events = store.list_events_on_date(day(0, 0).date()).await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| (e.result, e.check_type)).collect();
    assert_eq!(
        kinds,
        vec![
            (EventResult::Success, Some(CheckType::In)),
            (EventResult::Success, Some(CheckType::Out)),
        ]
    );
    assert_eq!(events[0].scheduled_start, Some(day(9, 0)));
    assert_eq!(events[0].late_minutes, Some(4));
}

#[tokio::test]
async fn resolution_failures_are_persisted() {
    let (store, kiosk) = setup().await;

    assert_eq!(
        kiosk.match_probe(&portrait(0, 3)).await.unwrap(),
        MatchVerdict::NoFace
    );
    attempt(&kiosk, &portrait(0, 3), day(8, 0)).await;
    attempt(&kiosk, &portrait(5, 3), day(8, 1)).await;

    let events = store.list_events_on_date(day(0, 0).date()).await.unwrap();
    let results: Vec<_> = events.iter().map(|e| e.result).collect();
    assert_eq!(results, vec![EventResult::NoFace, EventResult::NoMatch]);
    assert!(events.iter().all(|e| e.identity_id.is_none()));
}

#[tokio::test]
async fn removed_identity_no_longer_matches() {
    let (store, kiosk) = setup().await;
    let probe = portrait(2, 6);
    assert!(attempt(&kiosk, &probe, day(10, 0)).await.is_success());

    let removed = store.remove_identity("E200").await.unwrap();
    kiosk.forget(removed.id);

    assert!(matches!(
        kiosk.match_probe(&probe).await.unwrap(),
        MatchVerdict::NoMatch { .. }
    ));
    // Events outlive the identity.
    let events = store.list_events_on_date(day(0, 0).date()).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn shift_update_takes_effect_after_reload() {
    let (store, kiosk) = setup().await;
    kiosk.reload().await.unwrap();

    store
        .update_shift("E200", NaiveTime::from_hms_opt(7, 0, 0), None, 0)
        .await
        .unwrap();
    assert_eq!(kiosk.reload().await.unwrap(), 2);

    match attempt(&kiosk, &portrait(2, 6), day(7, 30)).await {
        AttendanceOutcome::Success { status, late_minutes, .. } => {
            assert_eq!(status, AttendanceStatus::Late);
            assert_eq!(late_minutes, 30);
        }
        other => panic!("expected late check-in, got {other:?}"),
    }
}
