//! Per-location configuration documents.
//!
//! Each location keeps three read-only JSON documents in the object store under
//! `configs/{location}/`. They are decoded into typed structures here and validated
//! before any caller sees them, so a malformed document surfaces as [`ConfigError`]
//! instead of a parse failure deep inside the report pipeline.

use crate::object_store::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

pub const VIEW_MANIFEST_FILE: &str = "image_master_config.json";
pub const REPORT_TEMPLATE_FILE: &str = "report_config.json";
pub const RECIPIENTS_FILE: &str = "notification_config.json";

/// Placeholder in the report subtitle replaced by the recording reference
pub const REFERENCE_PLACEHOLDER: &str = "{{containerRef}}";

/// Errors raised while loading per-location configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config {document} for location {location} does not exist")]
    Missing { location: String, document: String },

    #[error("config {document} for location {location} is malformed: {message}")]
    Malformed {
        location: String,
        document: String,
        message: String,
    },

    #[error("config {document} for location {location} is invalid: {message}")]
    Invalid {
        location: String,
        document: String,
        message: String,
    },

    #[error("config {document} for location {location} could not be fetched: {source}")]
    Unavailable {
        location: String,
        document: String,
        #[source]
        source: ObjectStoreError,
    },
}

/// One required photographic view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSpec {
    pub id: String,
    pub description: String,
}

/// Ordered list of the views a location requires for every recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewManifest {
    views: Vec<ViewSpec>,
}

impl ViewManifest {
    /// Build a manifest, rejecting empty lists, blank ids and duplicates
    pub fn new(views: Vec<ViewSpec>) -> Result<Self, String> {
        if views.is_empty() {
            return Err("at least one view is required".to_string());
        }
        let mut seen = HashSet::new();
        for view in &views {
            if view.id.trim().is_empty() {
                return Err("view id must not be blank".to_string());
            }
            if !seen.insert(view.id.as_str()) {
                return Err(format!("duplicate view id {}", view.id));
            }
        }
        Ok(Self { views })
    }

    pub fn views(&self) -> &[ViewSpec] {
        &self.views
    }

    /// Required view ids in manifest order
    pub fn required_ids(&self) -> impl Iterator<Item = &str> {
        self.views.iter().map(|v| v.id.as_str())
    }

    pub fn description(&self, id: &str) -> Option<&str> {
        self.views
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.description.as_str())
    }
}

/// Text blocks of the generated report
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportTemplate {
    pub header: String,
    pub title: String,
    pub subtitle: String,
    #[serde(alias = "covernote1", alias = "coverNote1")]
    pub cover_note_1: String,
    #[serde(alias = "covernote2", alias = "coverNote2")]
    pub cover_note_2: String,
    pub footer: String,
}

impl ReportTemplate {
    /// Subtitle with the recording reference substituted
    pub fn subtitle_for(&self, recording_ref: &str) -> String {
        self.subtitle.replace(REFERENCE_PLACEHOLDER, recording_ref)
    }
}

/// Who receives report notifications for a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientList {
    recipients: Vec<String>,
}

impl RecipientList {
    pub fn new(recipients: Vec<String>) -> Result<Self, String> {
        let recipients: Vec<String> = recipients
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err("at least one recipient is required".to_string());
        }
        if let Some(bad) = recipients.iter().find(|r| !r.contains('@')) {
            return Err(format!("not an email address: {bad}"));
        }
        Ok(Self { recipients })
    }

    pub fn as_slice(&self) -> &[String] {
        &self.recipients
    }
}

/// Read-only source of per-location configuration
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn view_manifest(&self, location_code: &str) -> Result<ViewManifest, ConfigError>;

    async fn report_template(&self, location_code: &str) -> Result<ReportTemplate, ConfigError>;

    async fn recipients(&self, location_code: &str) -> Result<RecipientList, ConfigError>;
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(alias = "containerViews")]
    views: Vec<RawView>,
}

#[derive(Deserialize)]
struct RawView {
    #[serde(alias = "view")]
    id: String,
    #[serde(default, alias = "viewDescription")]
    description: Option<String>,
}

/// The template either stands alone or is wrapped in a `reportConfigs` object
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTemplateDocument {
    Wrapped {
        #[serde(rename = "reportConfigs")]
        report_configs: ReportTemplate,
    },
    Flat(ReportTemplate),
}

#[derive(Deserialize)]
struct RawRecipients {
    #[serde(alias = "emails")]
    recipients: Vec<String>,
}

/// Parse a view manifest document
pub fn parse_view_manifest(location_code: &str, bytes: &[u8]) -> Result<ViewManifest, ConfigError> {
    let raw: RawManifest = decode(location_code, VIEW_MANIFEST_FILE, bytes)?;
    let views = raw
        .views
        .into_iter()
        .map(|v| ViewSpec {
            description: v.description.unwrap_or_else(|| v.id.clone()),
            id: v.id,
        })
        .collect();
    ViewManifest::new(views).map_err(|message| ConfigError::Invalid {
        location: location_code.to_string(),
        document: VIEW_MANIFEST_FILE.to_string(),
        message,
    })
}

/// Parse a report template document
pub fn parse_report_template(
    location_code: &str,
    bytes: &[u8],
) -> Result<ReportTemplate, ConfigError> {
    let raw: RawTemplateDocument = decode(location_code, REPORT_TEMPLATE_FILE, bytes)?;
    Ok(match raw {
        RawTemplateDocument::Wrapped { report_configs } => report_configs,
        RawTemplateDocument::Flat(template) => template,
    })
}

/// Parse a recipient list document
pub fn parse_recipients(location_code: &str, bytes: &[u8]) -> Result<RecipientList, ConfigError> {
    let raw: RawRecipients = decode(location_code, RECIPIENTS_FILE, bytes)?;
    RecipientList::new(raw.recipients).map_err(|message| ConfigError::Invalid {
        location: location_code.to_string(),
        document: RECIPIENTS_FILE.to_string(),
        message,
    })
}

fn decode<T: DeserializeOwned>(
    location_code: &str,
    document: &str,
    bytes: &[u8],
) -> Result<T, ConfigError> {
    serde_json::from_slice(bytes).map_err(|e| ConfigError::Malformed {
        location: location_code.to_string(),
        document: document.to_string(),
        message: e.to_string(),
    })
}

/// Object key of a per-location config document
pub fn config_object_key(location_code: &str, document: &str) -> String {
    format!("configs/{location_code}/{document}")
}

/// Config provider reading documents from the object store
pub struct ObjectStoreConfigProvider {
    objects: Arc<dyn ObjectStore>,
}

impl ObjectStoreConfigProvider {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    #[instrument(skip(self))]
    async fn fetch(&self, location_code: &str, document: &str) -> Result<Vec<u8>, ConfigError> {
        let key = config_object_key(location_code, document);
        match self.objects.get_object(&key).await {
            Ok(bytes) => {
                debug!(key = %key, "Loaded location config");
                Ok(bytes)
            }
            Err(ObjectStoreError::NotFound(_)) => Err(ConfigError::Missing {
                location: location_code.to_string(),
                document: document.to_string(),
            }),
            Err(source) => Err(ConfigError::Unavailable {
                location: location_code.to_string(),
                document: document.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl ConfigProvider for ObjectStoreConfigProvider {
    async fn view_manifest(&self, location_code: &str) -> Result<ViewManifest, ConfigError> {
        let bytes = self.fetch(location_code, VIEW_MANIFEST_FILE).await?;
        parse_view_manifest(location_code, &bytes)
    }

    async fn report_template(&self, location_code: &str) -> Result<ReportTemplate, ConfigError> {
        let bytes = self.fetch(location_code, REPORT_TEMPLATE_FILE).await?;
        parse_report_template(location_code, &bytes)
    }

    async fn recipients(&self, location_code: &str) -> Result<RecipientList, ConfigError> {
        let bytes = self.fetch(location_code, RECIPIENTS_FILE).await?;
        parse_recipients(location_code, &bytes)
    }
}
