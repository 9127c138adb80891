//! Record store seam.
//!
//! Identities, reference images and attendance events live in an external
//! record store. The core consumes it through [`RecordStore`]; events are
//! append-only and never mutated or deleted from here.

use crate::error::StoreError;
use crate::types::{AttendanceEvent, EventId, EventResult, Identity, IdentityId};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use std::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All enrolled identities, in enrollment order.
    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    async fn find_identity_by_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Identity>, StoreError>;

    /// SUCCESS events for one identity on one kiosk-local date, oldest first.
    async fn list_success_events_for_identity_on_date(
        &self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError>;

    async fn create_attendance_event(&self, event: &AttendanceEvent) -> Result<EventId, StoreError>;

    /// Encoded reference image (PNG, JPEG, ...) for an identity.
    async fn get_reference_image(&self, identity: &Identity) -> Result<Vec<u8>, StoreError>;
}

/// Enrollment request.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub external_user_id: String,
    pub display_name: String,
    pub shift_start: Option<NaiveTime>,
    pub shift_end: Option<NaiveTime>,
    pub grace_minutes: u32,
}

impl NewIdentity {
    pub fn new(external_user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            external_user_id: external_user_id.into(),
            display_name: display_name.into(),
            shift_start: None,
            shift_end: None,
            grace_minutes: 0,
        }
    }

    pub fn with_shift(mut self, start: Option<NaiveTime>, end: Option<NaiveTime>, grace_minutes: u32) -> Self {
        self.shift_start = start;
        self.shift_end = end;
        self.grace_minutes = grace_minutes;
        self
    }

    pub(crate) fn into_identity(self) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            external_user_id: self.external_user_id,
            display_name: self.display_name,
            shift_start: self.shift_start,
            shift_end: self.shift_end,
            grace_minutes: self.grace_minutes,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<(Identity, Vec<u8>)>,
    events: Vec<(EventId, AttendanceEvent)>,
}

/// In-process record store, insertion ordered. Used for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Enroll a new identity. Exactly one identity may exist per external user id.
    pub fn enroll(&self, new: NewIdentity, reference_image: Vec<u8>) -> Result<Identity, StoreError> {
        let mut state = self.write()?;
        if state
            .identities
            .iter()
            .any(|(i, _)| i.external_user_id == new.external_user_id)
        {
            return Err(StoreError::DuplicateUser(new.external_user_id));
        }
        let identity = new.into_identity();
        state.identities.push((identity.clone(), reference_image));
        Ok(identity)
    }

    /// Replace the shift fields of an identity.
    pub fn update_shift(
        &self,
        external_user_id: &str,
        shift_start: Option<NaiveTime>,
        shift_end: Option<NaiveTime>,
        grace_minutes: u32,
    ) -> Result<Identity, StoreError> {
        let mut state = self.write()?;
        let (identity, _) = state
            .identities
            .iter_mut()
            .find(|(i, _)| i.external_user_id == external_user_id)
            .ok_or_else(|| StoreError::IdentityNotFound(external_user_id.to_string()))?;
        identity.shift_start = shift_start;
        identity.shift_end = shift_end;
        identity.grace_minutes = grace_minutes;
        Ok(identity.clone())
    }

    /// Remove an identity. Its attendance events are kept.
    pub fn remove_identity(&self, external_user_id: &str) -> Result<Identity, StoreError> {
        let mut state = self.write()?;
        let pos = state
            .identities
            .iter()
            .position(|(i, _)| i.external_user_id == external_user_id)
            .ok_or_else(|| StoreError::IdentityNotFound(external_user_id.to_string()))?;
        Ok(state.identities.remove(pos).0)
    }

    /// Every event recorded so far, in creation order.
    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.read()
            .map(|s| s.events.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.read()?.identities.iter().map(|(i, _)| i.clone()).collect())
    }

    async fn find_identity_by_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .read()?
            .identities
            .iter()
            .find(|(i, _)| i.external_user_id == external_user_id)
            .map(|(i, _)| i.clone()))
    }

    async fn list_success_events_for_identity_on_date(
        &self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut events: Vec<AttendanceEvent> = self
            .read()?
            .events
            .iter()
            .map(|(_, e)| e)
            .filter(|e| {
                e.result == EventResult::Success
                    && e.identity_id == Some(identity_id)
                    && e.event_time.date() == date
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_time);
        Ok(events)
    }

    async fn create_attendance_event(&self, event: &AttendanceEvent) -> Result<EventId, StoreError> {
        let id = Uuid::new_v4();
        self.write()?.events.push((id, event.clone()));
        Ok(id)
    }

    async fn get_reference_image(&self, identity: &Identity) -> Result<Vec<u8>, StoreError> {
        self.read()?
            .identities
            .iter()
            .find(|(i, _)| i.id == identity.id)
            .map(|(_, image)| image.clone())
            .ok_or(StoreError::ReferenceImageMissing(identity.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn success(identity_id: IdentityId, time: &str) -> AttendanceEvent {
        AttendanceEvent {
            identity_id: Some(identity_id),
            result: EventResult::Success,
            similarity: Some(0.8),
            check_type: None,
            status: None,
            late_minutes: Some(0),
            scheduled_start: None,
            scheduled_end: None,
            event_time: at(time),
        }
    }

    #[test]
    fn test_enroll_rejects_duplicate_user() {
        let store = MemoryStore::new();
        store.enroll(NewIdentity::new("u1", "Ada"), vec![1]).unwrap();
        let err = store.enroll(NewIdentity::new("u1", "Ada again"), vec![2]).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUser(id) if id == "u1"));
    }

    #[tokio::test]
    async fn test_success_events_filtered_by_day_and_sorted() {
        let store = MemoryStore::new();
        let ada = store.enroll(NewIdentity::new("u1", "Ada"), vec![]).unwrap();
        let bob = store.enroll(NewIdentity::new("u2", "Bob"), vec![]).unwrap();

        store.create_attendance_event(&success(ada.id, "2026-03-02 17:00")).await.unwrap();
        store.create_attendance_event(&success(ada.id, "2026-03-02 09:00")).await.unwrap();
        store.create_attendance_event(&success(ada.id, "2026-03-01 09:00")).await.unwrap();
        store.create_attendance_event(&success(bob.id, "2026-03-02 09:30")).await.unwrap();
        store
            .create_attendance_event(&AttendanceEvent::unresolved(
                EventResult::NoMatch,
                Some(0.2),
                at("2026-03-02 10:00"),
            ))
            .await
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let events = store.list_success_events_for_identity_on_date(ada.id, day).await.unwrap();
        let times: Vec<_> = events.iter().map(|e| e.event_time).collect();
        assert_eq!(times, vec![at("2026-03-02 09:00"), at("2026-03-02 17:00")]);
        assert_eq!(store.events().len(), 5);
    }

    #[tokio::test]
    async fn test_remove_keeps_events_and_drops_image() {
        let store = MemoryStore::new();
        let ada = store.enroll(NewIdentity::new("u1", "Ada"), vec![9, 9]).unwrap();
        store.create_attendance_event(&success(ada.id, "2026-03-02 09:00")).await.unwrap();

        assert_eq!(store.get_reference_image(&ada).await.unwrap(), vec![9, 9]);
        store.remove_identity("u1").unwrap();

        assert!(store.find_identity_by_user_id("u1").await.unwrap().is_none());
        assert!(matches!(
            store.get_reference_image(&ada).await,
            Err(StoreError::ReferenceImageMissing(_))
        ));
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_update_shift() {
        let store = MemoryStore::new();
        store.enroll(NewIdentity::new("u1", "Ada"), vec![]).unwrap();
        let nine = NaiveTime::from_hms_opt(9, 0, 0);
        let updated = store.update_shift("u1", nine, None, 10).unwrap();
        assert_eq!(updated.shift_start, nine);
        assert_eq!(updated.grace_minutes, 10);
        assert!(store.update_shift("missing", None, None, 0).is_err());
    }
}
