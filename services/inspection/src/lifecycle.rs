//! Recording state machine.
//!
//! A recording is created `partial` on first touch and moves to `frozen` once, when every
//! view the location's manifest requires has been uploaded. The freeze write is the
//! durability boundary: the report and notification that follow it are best-effort and
//! never undo it.

use crate::error::InspectionError;
use crate::metadata_store::{ImageStore, RecordingStore, StoreError};
use crate::models::{now_stored, FreezeOutcome, Image, Recording, RecordingKey};
use crate::notify::Notifier;
use crate::report::{ReportArtifact, ReportBuilder};
use crate::site_config::{ConfigProvider, ViewManifest};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Which required views a recording still lacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completeness {
    pub complete: bool,
    /// Missing view ids, in manifest order
    pub missing: Vec<String>,
}

impl Completeness {
    pub fn evaluate(manifest: &ViewManifest, uploaded: &[Image]) -> Self {
        let present: HashSet<&str> = uploaded.iter().map(|i| i.view_name.as_str()).collect();
        let missing: Vec<String> = manifest
            .required_ids()
            .filter(|id| !present.contains(id))
            .map(str::to_string)
            .collect();

        Self {
            complete: missing.is_empty(),
            missing,
        }
    }
}

/// Upper bound on rendering and sending one report after a freeze
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct RecordingLifecycle {
    recordings: Arc<dyn RecordingStore>,
    images: Arc<dyn ImageStore>,
    configs: Arc<dyn ConfigProvider>,
    reports: Arc<dyn ReportBuilder>,
    notifier: Arc<dyn Notifier>,
    report_timeout: Duration,
}

impl RecordingLifecycle {
    pub fn new(
        recordings: Arc<dyn RecordingStore>,
        images: Arc<dyn ImageStore>,
        configs: Arc<dyn ConfigProvider>,
        reports: Arc<dyn ReportBuilder>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            recordings,
            images,
            configs,
            reports,
            notifier,
            report_timeout: DEFAULT_REPORT_TIMEOUT,
        }
    }

    pub fn with_report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }

    /// Return the recording, creating it as partial if it does not exist yet
    #[instrument(skip(self), fields(recording = %key))]
    pub async fn ensure_recording(&self, key: &RecordingKey) -> Result<Recording, InspectionError> {
        if let Some(existing) = self.recordings.find_recording(key).await? {
            return Ok(existing);
        }

        let recording = Recording::new_partial(key, now_stored());
        match self.recordings.insert_recording(&recording).await {
            Ok(()) => {
                metrics::counter!("inspection.recordings.created").increment(1);
                info!("Recording created");
                Ok(recording)
            }
            Err(StoreError::Conflict(_)) => {
                // Another request created it between our read and insert
                debug!("Recording created concurrently, re-reading");
                self.recordings
                    .find_recording(key)
                    .await?
                    .ok_or_else(|| InspectionError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compare uploaded views against the location's manifest
    pub async fn evaluate_completeness(
        &self,
        key: &RecordingKey,
    ) -> Result<Completeness, InspectionError> {
        let manifest = self.configs.view_manifest(&key.location_code).await?;
        let uploaded = self.images.find_by_recording(key).await?;
        Ok(Completeness::evaluate(&manifest, &uploaded))
    }

    /// Freeze the recording if every required view is present.
    ///
    /// On [`FreezeOutcome::FrozenNow`] the report is generated and, if that succeeds,
    /// recipients are notified before this returns. Failures in either are logged only.
    pub async fn freeze(&self, key: &RecordingKey) -> Result<FreezeOutcome, InspectionError> {
        let outcome = self.commit_freeze(key).await?;
        if outcome == FreezeOutcome::FrozenNow {
            self.publish_after_freeze(key).await;
        }
        Ok(outcome)
    }

    /// Check completeness and make the partial to frozen transition, without reporting.
    /// Only the caller that performs the transition sees [`FreezeOutcome::FrozenNow`].
    #[instrument(skip(self), fields(recording = %key))]
    pub async fn commit_freeze(&self, key: &RecordingKey) -> Result<FreezeOutcome, InspectionError> {
        let Some(recording) = self.recordings.find_recording(key).await? else {
            return Ok(FreezeOutcome::NotFound);
        };
        if recording.is_frozen() {
            debug!("Recording already frozen");
            return Ok(FreezeOutcome::AlreadyFrozen);
        }

        let completeness = self.evaluate_completeness(key).await?;
        if !completeness.complete {
            info!(missing = ?completeness.missing, "Recording incomplete, not freezing");
            return Ok(FreezeOutcome::StillIncomplete);
        }

        let Some(frozen) = self.recordings.mark_frozen(key, now_stored()).await? else {
            // Lost the transition: a concurrent freeze committed first and owns the report
            return match self.recordings.find_recording(key).await? {
                Some(_) => Ok(FreezeOutcome::AlreadyFrozen),
                None => Ok(FreezeOutcome::NotFound),
            };
        };

        metrics::counter!("inspection.recordings.frozen").increment(1);
        info!(frozen_at = ?frozen.frozen_at, "Recording frozen");
        Ok(FreezeOutcome::FrozenNow)
    }

    /// Generate the report for a freshly frozen recording and notify recipients.
    /// Bounded by the report timeout; failures and timeouts are logged, never returned.
    #[instrument(skip(self), fields(recording = %key))]
    pub async fn publish_after_freeze(&self, key: &RecordingKey) {
        match tokio::time::timeout(self.report_timeout, self.publish_report(key)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Report generation failed after freeze"),
            Err(_) => {
                metrics::counter!("inspection.reports.failed").increment(1);
                warn!(
                    timeout_secs = self.report_timeout.as_secs(),
                    "Report generation timed out after freeze"
                );
            }
        }
    }

    /// Render the report again for a recording that is already frozen
    #[instrument(skip(self), fields(recording = %key))]
    pub async fn regenerate_report(
        &self,
        key: &RecordingKey,
    ) -> Result<ReportArtifact, InspectionError> {
        let recording = self
            .recordings
            .find_recording(key)
            .await?
            .ok_or_else(|| InspectionError::NotFound(key.to_string()))?;
        if !recording.is_frozen() {
            return Err(InspectionError::validation(format!(
                "recording {key} is not frozen"
            )));
        }

        self.publish_report(key).await
    }

    async fn publish_report(&self, key: &RecordingKey) -> Result<ReportArtifact, InspectionError> {
        let report = match self.reports.build_report(key).await {
            Ok(report) => report,
            Err(e) => {
                metrics::counter!("inspection.reports.failed").increment(1);
                return Err(e.into());
            }
        };
        self.notifier.report_ready(key, &report).await;
        Ok(report)
    }
}
