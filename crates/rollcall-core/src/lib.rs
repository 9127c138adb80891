//! rollcall-core: matching pipeline and attendance state machine.
//!
//! A probe image is shortlisted against enrolled identities by a cheap
//! coarse signature, resolved to at most one identity by descriptor
//! distance, and turned into a correctly sequenced attendance event.
//! A stability detector decides when a live frame is settled enough to
//! become a probe.

pub mod config;
pub mod error;
pub mod index;
pub mod kiosk;
pub mod ledger;
pub mod matcher;
pub mod oracle;
pub mod signature;
pub mod sqlite;
pub mod stability;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::KioskConfig;
pub use error::{Fault, OracleError, StoreError};
pub use index::SignatureIndex;
pub use kiosk::Kiosk;
pub use ledger::AttendanceLedger;
pub use matcher::DescriptorMatcher;
pub use oracle::{CommandOracle, DescriptorOracle, Extraction};
pub use signature::Signature;
pub use sqlite::SqliteStore;
pub use stability::StabilityDetector;
pub use store::{MemoryStore, NewIdentity, RecordStore};
pub use types::{
    AttendanceEvent, AttendanceOutcome, AttendanceStatus, CheckType, Descriptor, EventId,
    EventResult, FailureReason, Identity, IdentityId, MatchVerdict,
};
