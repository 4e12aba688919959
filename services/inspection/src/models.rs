use crate::error::InspectionError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Natural key of a recording: one inspection session at one location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordingKey {
    pub location_code: String,
    pub recording_ref: String,
}

impl RecordingKey {
    /// Build a key, rejecting identifiers that are unsafe as object key components
    pub fn new(
        location_code: impl Into<String>,
        recording_ref: impl Into<String>,
    ) -> Result<Self, InspectionError> {
        let location_code = location_code.into();
        let recording_ref = recording_ref.into();
        validate_identifier("location code", &location_code)?;
        validate_identifier("recording reference", &recording_ref)?;
        Ok(Self {
            location_code,
            recording_ref,
        })
    }

    /// Object key of an uploaded view image
    /// Format: content/{location}/{ref}/{view}.jpg
    pub fn view_object_key(&self, view: &str) -> String {
        format!(
            "content/{}/{}/{}.jpg",
            self.location_code, self.recording_ref, view
        )
    }

    /// Object key of the rendered report (overwritten on regeneration)
    /// Format: content/{location}/{ref}/{ref}.report
    pub fn report_object_key(&self) -> String {
        format!(
            "content/{loc}/{rec}/{rec}.report",
            loc = self.location_code,
            rec = self.recording_ref
        )
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_code, self.recording_ref)
    }
}

/// Reject empty identifiers and anything that could escape its path segment
pub fn validate_identifier(what: &str, value: &str) -> Result<(), InspectionError> {
    if value.trim().is_empty() {
        return Err(InspectionError::validation(format!("{what} is required")));
    }
    if value.contains("..") {
        return Err(InspectionError::validation(format!(
            "{what} must not contain '..': {value}"
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(InspectionError::validation(format!(
            "{what} may only contain letters, digits, '-', '_' and '.': {value}"
        )));
    }
    Ok(())
}

/// Lifecycle status of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Intake still open
    Partial,
    /// Intake finished; terminal
    Frozen,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Partial => "partial",
            RecordingStatus::Frozen => "frozen",
        }
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial" => Ok(RecordingStatus::Partial),
            "frozen" => Ok(RecordingStatus::Frozen),
            other => Err(format!("unknown recording status: {other}")),
        }
    }
}

impl TryFrom<String> for RecordingStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Timestamps are stored with microsecond precision
pub fn stored_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// Current time at stored precision, so a value compares equal after a round trip
pub fn now_stored() -> DateTime<Utc> {
    stored_precision(Utc::now())
}

/// Stored recording row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Recording {
    pub location_code: String,
    pub recording_ref: String,
    #[sqlx(try_from = "String")]
    pub status: RecordingStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly when status is frozen
    pub frozen_at: Option<DateTime<Utc>>,
}

impl Recording {
    /// A fresh, partial recording
    pub fn new_partial(key: &RecordingKey, created_at: DateTime<Utc>) -> Self {
        Self {
            location_code: key.location_code.clone(),
            recording_ref: key.recording_ref.clone(),
            status: RecordingStatus::Partial,
            created_at,
            frozen_at: None,
        }
    }

    pub fn key(&self) -> RecordingKey {
        RecordingKey {
            location_code: self.location_code.clone(),
            recording_ref: self.recording_ref.clone(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.status == RecordingStatus::Frozen
    }
}

/// Stored image row; one per (location, ref, view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub location_code: String,
    pub recording_ref: String,
    pub view_name: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Result of a freeze request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeOutcome {
    /// No recording exists for the key
    NotFound,
    /// Recording was already frozen; nothing changed
    AlreadyFrozen,
    /// Required views are missing; nothing changed
    StillIncomplete,
    /// Recording transitioned to frozen by this call
    FrozenNow,
}
