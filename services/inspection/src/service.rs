//! Caller-facing operations.
//!
//! Every operation validates its identifiers, runs under the configured request deadline
//! and returns [`InspectionError`]. Reading a recording page never fails because of a
//! config or blob problem; the page is returned with `degraded` set instead.

use crate::config::Config;
use crate::error::InspectionError;
use crate::lifecycle::{Completeness, RecordingLifecycle};
use crate::metadata_store::{ImageStore, RecordingStore};
use crate::models::{
    now_stored, validate_identifier, FreezeOutcome, Recording, RecordingKey, RecordingStatus,
};
use crate::notify::{HttpEmailTransport, NoopNotifier, NotificationDispatcher, Notifier};
use crate::object_store::{ObjectStore, SignedUrl, CONTENT_TYPE_JPEG};
use crate::report::pdf::EmbeddedImage;
use crate::report::{ReportArtifact, ReportGenerator};
use crate::retry::RetryPolicy;
use crate::site_config::{ConfigProvider, ObjectStoreConfigProvider};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default window of [`InspectionService::recent_recordings`]
pub const DEFAULT_RECENT_WINDOW_DAYS: i64 = 30;

/// Strip an optional `data:<mime>;base64,` prefix and decode the payload
pub fn decode_data_url(payload: &str) -> Result<Vec<u8>, InspectionError> {
    let encoded = match payload.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => {
            if !prefix.ends_with(";base64") {
                return Err(InspectionError::validation(
                    "image payload must be base64 encoded",
                ));
            }
            data
        }
        _ => payload,
    };

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| InspectionError::validation(format!("invalid base64 image payload: {e}")))?;
    if bytes.is_empty() {
        return Err(InspectionError::validation("image payload is empty"));
    }
    Ok(bytes)
}

/// View blobs are always stored as JPEG; other recognised formats are re-encoded
pub fn normalize_upload(view: &str, bytes: Vec<u8>) -> Result<Vec<u8>, InspectionError> {
    match image::guess_format(&bytes) {
        Ok(image::ImageFormat::Jpeg) => Ok(bytes),
        Ok(format) => {
            debug!(view = %view, format = ?format, "Re-encoding upload as JPEG");
            EmbeddedImage::from_bytes(bytes)
                .map(|image| image.jpeg)
                .map_err(|e| {
                    InspectionError::validation(format!("payload for view {view} could not be decoded: {e}"))
                })
        }
        Err(_) => Err(InspectionError::validation(format!(
            "payload for view {view} is not a recognised image"
        ))),
    }
}

/// One required view as shown on the recording page
#[derive(Debug, Clone, Serialize)]
pub struct ViewSlot {
    pub id: String,
    pub description: String,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub url: Option<SignedUrl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingPage {
    pub recording: Recording,
    pub views: Vec<ViewSlot>,
    pub completeness: Completeness,
    pub is_partial: bool,
    pub report_url: Option<SignedUrl>,
    /// Some config or blob lookup failed and the page is incomplete
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub key: RecordingKey,
    pub view: String,
    pub object_key: String,
    pub uploaded_at: DateTime<Utc>,
    pub url: Option<SignedUrl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentRecordings {
    pub location_code: String,
    pub since: DateTime<Utc>,
    pub partial: Vec<Recording>,
    pub frozen: Vec<Recording>,
    pub partial_count: usize,
    pub frozen_count: usize,
}

/// Timeouts and link lifetimes applied by the service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub request_timeout: Duration,
    pub view_url_expiry: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            view_url_expiry: Duration::from_secs(3600),
        }
    }
}

pub struct InspectionService {
    lifecycle: Arc<RecordingLifecycle>,
    recordings: Arc<dyn RecordingStore>,
    images: Arc<dyn ImageStore>,
    objects: Arc<dyn ObjectStore>,
    configs: Arc<dyn ConfigProvider>,
    settings: ServiceSettings,
}

impl InspectionService {
    pub fn new(
        lifecycle: Arc<RecordingLifecycle>,
        recordings: Arc<dyn RecordingStore>,
        images: Arc<dyn ImageStore>,
        objects: Arc<dyn ObjectStore>,
        configs: Arc<dyn ConfigProvider>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            lifecycle,
            recordings,
            images,
            objects,
            configs,
            settings,
        }
    }

    /// Wire the service from configuration around the given stores
    pub fn from_config<M>(
        config: &Config,
        metadata: Arc<M>,
        objects: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<Self>
    where
        M: RecordingStore + ImageStore + 'static,
    {
        let configs: Arc<dyn ConfigProvider> =
            Arc::new(ObjectStoreConfigProvider::new(objects.clone()));

        let reports = Arc::new(ReportGenerator::new(
            objects.clone(),
            configs.clone(),
            RetryPolicy::new(
                config.report.download_attempts,
                config.report.initial_backoff(),
            ),
        ));

        let notifier: Arc<dyn Notifier> = if config.notification.enabled {
            Arc::new(NotificationDispatcher::new(
                configs.clone(),
                objects.clone(),
                Arc::new(HttpEmailTransport::new(&config.notification)?),
                config.notification_url_expiry(),
            ))
        } else {
            Arc::new(NoopNotifier)
        };

        let lifecycle = Arc::new(RecordingLifecycle::new(
            metadata.clone(),
            metadata.clone(),
            configs.clone(),
            reports,
            notifier,
        )
        .with_report_timeout(config.report.timeout()));

        Ok(Self::new(
            lifecycle,
            metadata.clone(),
            metadata,
            objects,
            configs,
            ServiceSettings {
                request_timeout: config.request_timeout(),
                view_url_expiry: config.view_url_expiry(),
            },
        ))
    }

    async fn with_deadline<T, F>(&self, operation: F) -> Result<T, InspectionError>
    where
        F: Future<Output = Result<T, InspectionError>>,
    {
        match tokio::time::timeout(self.settings.request_timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("inspection.requests.deadline_exceeded").increment(1);
                Err(InspectionError::DeadlineExceeded(self.settings.request_timeout))
            }
        }
    }

    /// Load the recording page, creating the recording on first access
    #[instrument(skip(self))]
    pub async fn get_or_render_recording(
        &self,
        location_code: &str,
        recording_ref: &str,
    ) -> Result<RecordingPage, InspectionError> {
        let key = RecordingKey::new(location_code, recording_ref)?;
        self.with_deadline(self.render_page(key)).await
    }

    async fn render_page(&self, key: RecordingKey) -> Result<RecordingPage, InspectionError> {
        let recording = self.lifecycle.ensure_recording(&key).await?;
        let uploaded = self.images.find_by_recording(&key).await?;
        let mut degraded = false;

        let (views, completeness) = match self.configs.view_manifest(&key.location_code).await {
            Ok(manifest) => {
                let uploaded_at: HashMap<&str, DateTime<Utc>> = uploaded
                    .iter()
                    .map(|i| (i.view_name.as_str(), i.uploaded_at))
                    .collect();

                let mut views = Vec::with_capacity(manifest.views().len());
                for view in manifest.views() {
                    let uploaded_at = uploaded_at.get(view.id.as_str()).copied();
                    let url = match uploaded_at {
                        Some(_) => {
                            let url = self.sign(&key.view_object_key(&view.id)).await;
                            degraded |= url.is_none();
                            url
                        }
                        None => None,
                    };
                    views.push(ViewSlot {
                        id: view.id.clone(),
                        description: view.description.clone(),
                        uploaded_at,
                        url,
                    });
                }
                (views, Completeness::evaluate(&manifest, &uploaded))
            }
            Err(e) => {
                warn!(recording = %key, error = %e, "View manifest unavailable, page degraded");
                degraded = true;
                let unknown = Completeness {
                    complete: false,
                    missing: Vec::new(),
                };
                (Vec::new(), unknown)
            }
        };

        let report_url = if recording.is_frozen() {
            let url = self.sign(&key.report_object_key()).await;
            degraded |= url.is_none();
            url
        } else {
            None
        };

        Ok(RecordingPage {
            is_partial: !recording.is_frozen(),
            recording,
            views,
            completeness,
            report_url,
            degraded,
        })
    }

    async fn sign(&self, object_key: &str) -> Option<SignedUrl> {
        match self
            .objects
            .presigned_get_url(object_key, self.settings.view_url_expiry)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(object_key = %object_key, error = %e, "Failed to sign URL");
                None
            }
        }
    }

    /// Store one view image and record it against the recording
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn record_upload(
        &self,
        location_code: &str,
        recording_ref: &str,
        view: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt, InspectionError> {
        let key = RecordingKey::new(location_code, recording_ref)?;
        validate_identifier("view", view)?;
        if bytes.is_empty() {
            return Err(InspectionError::validation("image payload is empty"));
        }
        let bytes = normalize_upload(view, bytes)?;

        self.with_deadline(async {
            self.lifecycle.ensure_recording(&key).await?;

            let object_key = key.view_object_key(view);
            self.objects
                .put_object(&object_key, bytes, CONTENT_TYPE_JPEG)
                .await?;

            let uploaded_at = now_stored();
            self.images.upsert_image(&key, view, uploaded_at).await?;
            info!(recording = %key, view = %view, "View uploaded");

            let url = self.sign(&object_key).await;
            Ok::<_, InspectionError>(UploadReceipt {
                key: key.clone(),
                view: view.to_string(),
                object_key,
                uploaded_at,
                url,
            })
        })
        .await
    }

    /// Decode a base64 or data-URL payload and store it as [`Self::record_upload`] does
    pub async fn record_upload_encoded(
        &self,
        location_code: &str,
        recording_ref: &str,
        view: &str,
        payload: &str,
    ) -> Result<UploadReceipt, InspectionError> {
        let bytes = decode_data_url(payload)?;
        self.record_upload(location_code, recording_ref, view, bytes)
            .await
    }

    #[instrument(skip(self))]
    pub async fn freeze_recording(
        &self,
        location_code: &str,
        recording_ref: &str,
    ) -> Result<FreezeOutcome, InspectionError> {
        let key = RecordingKey::new(location_code, recording_ref)?;
        // The deadline covers the decision and the commit only. Once frozen, the
        // report runs under its own timeout and the outcome stands.
        let outcome = self.with_deadline(self.lifecycle.commit_freeze(&key)).await?;
        if outcome == FreezeOutcome::FrozenNow {
            self.lifecycle.publish_after_freeze(&key).await;
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn regenerate_report(
        &self,
        location_code: &str,
        recording_ref: &str,
    ) -> Result<ReportArtifact, InspectionError> {
        let key = RecordingKey::new(location_code, recording_ref)?;
        self.with_deadline(self.lifecycle.regenerate_report(&key))
            .await
    }

    /// Partial and frozen recordings created within `window`, newest first
    #[instrument(skip(self))]
    pub async fn recent_recordings(
        &self,
        location_code: &str,
        window: chrono::Duration,
    ) -> Result<RecentRecordings, InspectionError> {
        validate_identifier("location code", location_code)?;
        if window <= chrono::Duration::zero() {
            return Err(InspectionError::validation("window must be positive"));
        }
        let since = Utc::now() - window;

        self.with_deadline(async {
            let partial = self
                .recordings
                .list_recordings_since(location_code, RecordingStatus::Partial, since)
                .await?;
            let frozen = self
                .recordings
                .list_recordings_since(location_code, RecordingStatus::Frozen, since)
                .await?;

            Ok::<_, InspectionError>(RecentRecordings {
                location_code: location_code.to_string(),
                since,
                partial_count: partial.len(),
                frozen_count: frozen.len(),
                partial,
                frozen,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_url() {
        let bytes = decode_data_url("data:image/jpeg;base64,/9j/4AA=").unwrap();
        assert_eq!(bytes, vec![0xff, 0xd8, 0xff, 0xe0, 0x00]);

        let bare = decode_data_url("/9j/4AA=").unwrap();
        assert_eq!(bare, bytes);
    }

    #[test]
    fn test_decode_data_url_rejects_bad_payloads() {
        assert!(matches!(
            decode_data_url("data:image/jpeg;base64,!!!"),
            Err(InspectionError::Validation(_))
        ));
        assert!(matches!(
            decode_data_url("data:image/jpeg,rawdata"),
            Err(InspectionError::Validation(_))
        ));
        assert!(matches!(
            decode_data_url("data:image/jpeg;base64,"),
            Err(InspectionError::Validation(_))
        ));
    }

    #[test]
    fn test_normalize_upload_reencodes_png() {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(4, 3))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let stored = normalize_upload("A", png).unwrap();
        assert_eq!(image::guess_format(&stored).unwrap(), image::ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&stored).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn test_normalize_upload_keeps_jpeg_and_rejects_garbage() {
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::new(2, 2))
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        assert_eq!(normalize_upload("A", jpeg.clone()).unwrap(), jpeg);

        assert!(matches!(
            normalize_upload("A", b"not an image".to_vec()),
            Err(InspectionError::Validation(_))
        ));
    }
}
