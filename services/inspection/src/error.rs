//! Caller-facing error taxonomy.
//!
//! Component errors ([`StoreError`], [`ObjectStoreError`], [`ConfigError`]) convert into
//! [`InspectionError`] at the service boundary. Report and notification errors never reach
//! callers: they happen downstream of a committed freeze and are logged instead.

use crate::metadata_store::StoreError;
use crate::object_store::ObjectStoreError;
use crate::report::ReportError;
use crate::site_config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the inspection service
#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("recording not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("external dependency temporarily unavailable: {0}")]
    TransientExternal(String),

    #[error("external dependency failed permanently: {0}")]
    PermanentExternal(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("operation exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl InspectionError {
    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for errors the caller caused and can fix
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Validation(_))
    }
}

impl From<ObjectStoreError> for InspectionError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::NotFound(key) => {
                Self::PermanentExternal(format!("object not found: {key}"))
            }
            other => Self::TransientExternal(other.to_string()),
        }
    }
}

impl From<ReportError> for InspectionError {
    fn from(e: ReportError) -> Self {
        match e {
            ReportError::Config(config) => Self::Config(config),
            permanent @ (ReportError::ViewDownload {
                source: ObjectStoreError::NotFound(_),
                ..
            }
            | ReportError::InvalidImage { .. }
            | ReportError::Render(_)) => Self::PermanentExternal(permanent.to_string()),
            other => Self::TransientExternal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert!(InspectionError::validation("missing view").is_client_error());
        assert!(InspectionError::NotFound("L1/R1".to_string()).is_client_error());
        assert!(!InspectionError::DeadlineExceeded(Duration::from_secs(1)).is_client_error());
    }

    #[test]
    fn test_object_store_error_mapping() {
        let missing: InspectionError =
            ObjectStoreError::NotFound("content/L1/R1/A.jpg".to_string()).into();
        assert!(matches!(missing, InspectionError::PermanentExternal(_)));

        let flaky: InspectionError = ObjectStoreError::Request {
            operation: "put_object",
            key: "content/L1/R1/A.jpg".to_string(),
            message: "connection reset".to_string(),
        }
        .into();
        assert!(matches!(flaky, InspectionError::TransientExternal(_)));
    }

    #[test]
    fn test_report_error_mapping() {
        let missing_view: InspectionError = ReportError::ViewDownload {
            view: "F".to_string(),
            attempts: 3,
            source: ObjectStoreError::NotFound("content/L1/R1/F.jpg".to_string()),
        }
        .into();
        assert!(matches!(missing_view, InspectionError::PermanentExternal(_)));
        assert!(missing_view.to_string().contains("view F after 3 attempts"));

        let upload: InspectionError = ReportError::Upload(ObjectStoreError::Request {
            operation: "put_object",
            key: "content/L1/R1/R1.report".to_string(),
            message: "timeout".to_string(),
        })
        .into();
        assert!(matches!(upload, InspectionError::TransientExternal(_)));
    }
}
