use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type IdentityId = Uuid;
pub type EventId = Uuid;

/// An enrolled person eligible for attendance matching.
///
/// The reference image is owned by the record store and fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Stable, unique identifier from the upstream user directory.
    pub external_user_id: String,
    pub display_name: String,
    pub shift_start: Option<NaiveTime>,
    pub shift_end: Option<NaiveTime>,
    /// Minutes after `shift_start` during which a check-in is still on time.
    pub grace_minutes: u32,
}

/// Cosine similarity between two vectors, clamped to [-1, 1].
///
/// Returns 0.0 when either vector has zero norm. Always processes every
/// dimension of the shorter vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Face descriptor produced by the external embedding oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance, in the descriptor's native units.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine similarity in [-1, 1].
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Convert a descriptor distance into the [0, 1] similarity shown to users.
pub fn distance_to_similarity(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

/// Outcome category recorded on every attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventResult {
    Success,
    NoMatch,
    NoFace,
    MultipleFaces,
}

string_enum!(EventResult {
    Success => "SUCCESS",
    NoMatch => "NO_MATCH",
    NoFace => "NO_FACE",
    MultipleFaces => "MULTIPLE_FACES",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    In,
    Out,
}

string_enum!(CheckType {
    In => "IN",
    Out => "OUT",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    OnTime,
    Late,
    Early,
}

string_enum!(AttendanceStatus {
    OnTime => "ON_TIME",
    Late => "LATE",
    Early => "EARLY",
});

/// An append-only attendance record. Times are kiosk-local wall-clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Absent when no identity was resolved.
    pub identity_id: Option<IdentityId>,
    pub result: EventResult,
    /// Display similarity in [0, 1].
    pub similarity: Option<f32>,
    pub check_type: Option<CheckType>,
    pub status: Option<AttendanceStatus>,
    pub late_minutes: Option<u32>,
    pub scheduled_start: Option<NaiveDateTime>,
    pub scheduled_end: Option<NaiveDateTime>,
    pub event_time: NaiveDateTime,
}

impl AttendanceEvent {
    /// Event for an attempt that did not resolve to an identity.
    pub fn unresolved(result: EventResult, similarity: Option<f32>, event_time: NaiveDateTime) -> Self {
        Self {
            identity_id: None,
            result,
            similarity,
            check_type: None,
            status: None,
            late_minutes: None,
            scheduled_start: None,
            scheduled_end: None,
            event_time,
        }
    }
}

/// Result of resolving a probe image to an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchVerdict {
    Match { identity: Identity, similarity: f32 },
    /// Best similarity is still reported to aid diagnostics.
    NoMatch { similarity: f32 },
    NoFace,
    MultipleFaces { count: usize },
}

/// Why an attendance attempt did not produce a SUCCESS event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NoMatch,
    NoFace,
    MultipleFaces,
    DayCompleted,
    TooSoon,
}

string_enum!(FailureReason {
    NoMatch => "NO_MATCH",
    NoFace => "NO_FACE",
    MultipleFaces => "MULTIPLE_FACES",
    DayCompleted => "DAY_COMPLETED",
    TooSoon => "TOO_SOON",
});

/// User-facing result of an attendance attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttendanceOutcome {
    Success {
        identity: Identity,
        check_type: CheckType,
        status: AttendanceStatus,
        late_minutes: u32,
        similarity: f32,
        scheduled_start: Option<NaiveDateTime>,
        scheduled_end: Option<NaiveDateTime>,
        event_time: NaiveDateTime,
    },
    Failure {
        reason: FailureReason,
        similarity: Option<f32>,
    },
}

impl AttendanceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
