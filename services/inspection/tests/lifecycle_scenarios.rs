use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, RgbImage};
use inspection_service::memory::{MemoryMetadataStore, MemoryObjectStore};
use inspection_service::metadata_store::{ImageStore, RecordingStore, StoreError};
use inspection_service::notify::{EmailMessage, NotifyError};
use inspection_service::object_store::{ObjectStore, ObjectStoreError, CONTENT_TYPE_PDF};
use inspection_service::service::ServiceSettings;
use inspection_service::site_config::ConfigProvider;
use inspection_service::{
    FreezeOutcome, Image, InspectionError, InspectionService, NotificationDispatcher,
    NotificationTransport, ObjectStoreConfigProvider, Recording, RecordingKey, RecordingLifecycle,
    RecordingStatus, ReportArtifact, ReportBuilder, ReportError, ReportGenerator, RetryPolicy,
};
use serde_json::json;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Mutex};

const VIEWS: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

fn tiny_jpeg() -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 9, image::Rgb([90, 120, 30])));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    bytes
}

async fn seed_location(objects: &MemoryObjectStore, location: &str) {
    let views: Vec<_> = VIEWS
        .iter()
        .map(|id| json!({ "id": id, "description": format!("Side {id}") }))
        .collect();
    objects
        .put_json(
            &format!("configs/{location}/image_master_config.json"),
            &json!({ "views": views }),
        )
        .await;
    objects
        .put_json(
            &format!("configs/{location}/report_config.json"),
            &json!({
                "reportConfigs": {
                    "header": "Harbour Survey",
                    "title": "Container Inspection",
                    "subtitle": "Container {{containerRef}}",
                    "covernote1": "All photographs were taken on arrival.",
                    "covernote2": "Condition is assessed visually.",
                    "footer": "Harbour Survey - internal"
                }
            }),
        )
        .await;
    objects
        .put_json(
            &format!("configs/{location}/notification_config.json"),
            &json!({ "recipients": ["ops@example.com", "yard@example.com"] }),
        )
        .await;
}

/// Transport that records messages and can be told to fail
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<EmailMessage>>,
    fail: bool,
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Request("connection refused".to_string()));
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Counts calls and delegates, optionally failing or stalling instead
struct CountingReports {
    inner: Option<ReportGenerator>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

#[async_trait]
impl ReportBuilder for CountingReports {
    async fn build_report(&self, key: &RecordingKey) -> Result<ReportArtifact, ReportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.inner {
            Some(generator) => generator.build_report(key).await,
            None => Err(ReportError::Upload(ObjectStoreError::Request {
                operation: "put_object",
                key: key.report_object_key(),
                message: "bucket unavailable".to_string(),
            })),
        }
    }
}

struct Harness {
    metadata: Arc<MemoryMetadataStore>,
    objects: Arc<MemoryObjectStore>,
    reports: Arc<CountingReports>,
    transport: Arc<RecordingTransport>,
    service: InspectionService,
}

#[derive(Default)]
struct HarnessOptions {
    failing_report: bool,
    failing_transport: bool,
    report_delay: Option<Duration>,
    report_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

async fn harness(options: HarnessOptions) -> Harness {
    let metadata = Arc::new(MemoryMetadataStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    seed_location(&objects, "L1").await;
    seed_location(&objects, "L2").await;

    let configs: Arc<dyn ConfigProvider> =
        Arc::new(ObjectStoreConfigProvider::new(objects.clone()));
    let generator = ReportGenerator::new(
        objects.clone(),
        configs.clone(),
        RetryPolicy::new(3, Duration::from_millis(5)),
    );
    let reports = Arc::new(CountingReports {
        inner: (!options.failing_report).then_some(generator),
        delay: options.report_delay,
        calls: AtomicUsize::new(0),
    });
    let transport = Arc::new(RecordingTransport {
        sent: Mutex::new(Vec::new()),
        fail: options.failing_transport,
    });
    let notifier = Arc::new(NotificationDispatcher::new(
        configs.clone(),
        objects.clone(),
        transport.clone(),
        Duration::from_secs(24 * 3600),
    ));

    let mut lifecycle = RecordingLifecycle::new(
        metadata.clone(),
        metadata.clone(),
        configs.clone(),
        reports.clone(),
        notifier,
    );
    if let Some(timeout) = options.report_timeout {
        lifecycle = lifecycle.with_report_timeout(timeout);
    }
    let lifecycle = Arc::new(lifecycle);
    let mut settings = ServiceSettings::default();
    if let Some(timeout) = options.request_timeout {
        settings.request_timeout = timeout;
    }
    let service = InspectionService::new(
        lifecycle,
        metadata.clone(),
        metadata.clone(),
        objects.clone(),
        configs,
        settings,
    );

    Harness {
        metadata,
        objects,
        reports,
        transport,
        service,
    }
}

async fn upload_views(
    service: &InspectionService,
    location: &str,
    recording: &str,
    views: &[&str],
) {
    for view in views {
        service
            .record_upload(location, recording, view, tiny_jpeg())
            .await
            .unwrap();
    }
}

async fn stored_recording(
    metadata: &MemoryMetadataStore,
    location: &str,
    recording: &str,
) -> Recording {
    metadata
        .find_recording(&RecordingKey::new(location, recording).unwrap())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_recording_freezes_once_last_view_arrives() {
    let h = harness(HarnessOptions::default()).await;

    upload_views(&h.service, "L1", "R1", &VIEWS[..5]).await;
    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();
    assert_eq!(outcome, FreezeOutcome::StillIncomplete);
    assert_eq!(
        stored_recording(&h.metadata, "L1", "R1").await.status,
        RecordingStatus::Partial
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    upload_views(&h.service, "L1", "R1", &["F"]).await;
    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();
    assert_eq!(outcome, FreezeOutcome::FrozenNow);

    let recording = stored_recording(&h.metadata, "L1", "R1").await;
    assert_eq!(recording.status, RecordingStatus::Frozen);
    let frozen_at = recording.frozen_at.expect("frozen_at is set");
    assert!(frozen_at > recording.created_at);

    assert!(h.objects.contains("content/L1/R1/R1.report").await);
    assert_eq!(
        h.objects.content_type("content/L1/R1/R1.report").await.as_deref(),
        Some(CONTENT_TYPE_PDF)
    );
    let report = h.objects.get_object("content/L1/R1/R1.report").await.unwrap();
    let pdf = lopdf::Document::load_mem(&report).unwrap();
    assert_eq!(pdf.get_pages().len(), 4);

    let sent = h.transport.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipients, vec!["ops@example.com", "yard@example.com"]);
    assert!(sent[0].text.contains("memory://content/L1/R1/R1.report"));
}

#[tokio::test]
async fn test_reupload_overwrites_single_row() {
    let h = harness(HarnessOptions::default()).await;

    let first = h
        .service
        .record_upload("L1", "R1", "A", tiny_jpeg())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = h
        .service
        .record_upload("L1", "R1", "A", tiny_jpeg())
        .await
        .unwrap();

    let key = RecordingKey::new("L1", "R1").unwrap();
    let images: Vec<Image> = h.metadata.find_by_recording(&key).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(h.metadata.image_count(&key).await, 1);
    assert_eq!(images[0].uploaded_at, second.uploaded_at);
    assert!(second.uploaded_at > first.uploaded_at);
    assert_eq!(second.object_key, "content/L1/R1/A.jpg");
    assert!(second.url.is_some());
    assert_eq!(h.metadata.recording_count().await, 1);
}

#[tokio::test]
async fn test_second_freeze_changes_nothing() {
    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    assert_eq!(
        h.service.freeze_recording("L1", "R1").await.unwrap(),
        FreezeOutcome::FrozenNow
    );
    let frozen_at = stored_recording(&h.metadata, "L1", "R1").await.frozen_at;

    for _ in 0..2 {
        assert_eq!(
            h.service.freeze_recording("L1", "R1").await.unwrap(),
            FreezeOutcome::AlreadyFrozen
        );
    }
    assert_eq!(stored_recording(&h.metadata, "L1", "R1").await.frozen_at, frozen_at);
    assert_eq!(h.reports.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_incomplete_freeze_skips_report() {
    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &["A", "C"]).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::StillIncomplete);
    assert_eq!(h.reports.calls.load(Ordering::SeqCst), 0);
    assert!(!h.objects.contains("content/L1/R1/R1.report").await);
    let recording = stored_recording(&h.metadata, "L1", "R1").await;
    assert_eq!(recording.status, RecordingStatus::Partial);
    assert!(recording.frozen_at.is_none());
}

#[tokio::test]
async fn test_freeze_unknown_recording() {
    let h = harness(HarnessOptions::default()).await;
    assert_eq!(
        h.service.freeze_recording("L1", "NOPE").await.unwrap(),
        FreezeOutcome::NotFound
    );
    assert_eq!(h.metadata.recording_count().await, 0);
}

#[tokio::test]
async fn test_report_failure_keeps_freeze() {
    let h = harness(HarnessOptions {
        failing_report: true,
        ..Default::default()
    })
    .await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    let recording = stored_recording(&h.metadata, "L1", "R1").await;
    assert_eq!(recording.status, RecordingStatus::Frozen);
    assert!(recording.frozen_at.is_some());
    assert!(h.transport.sent.lock().await.is_empty());
}

#[tokio::test]
async fn test_missing_view_blob_aborts_report_only() {
    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;
    h.objects.remove("content/L1/R1/D.jpg").await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    assert!(!h.objects.contains("content/L1/R1/R1.report").await);
    assert!(h.transport.sent.lock().await.is_empty());

    let err = h.service.regenerate_report("L1", "R1").await.unwrap_err();
    assert!(matches!(err, InspectionError::PermanentExternal(_)));
    assert!(err.to_string().contains("view D after 3 attempts"));
}

#[tokio::test]
async fn test_transient_download_failures_are_retried() {
    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;
    h.objects.fail_next_gets("content/L1/R1/B.jpg", 2).await;
    h.objects.fail_next_gets("content/L1/R1/E.jpg", 1).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    assert!(h.objects.contains("content/L1/R1/R1.report").await);
}

#[tokio::test]
async fn test_notification_failure_does_not_change_outcome() {
    let h = harness(HarnessOptions {
        failing_transport: true,
        ..Default::default()
    })
    .await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    assert!(h.objects.contains("content/L1/R1/R1.report").await);
    assert_eq!(
        stored_recording(&h.metadata, "L1", "R1").await.status,
        RecordingStatus::Frozen
    );
}

/// Holds the first two lookups until both callers have made them, so both miss
struct RacingStore {
    inner: MemoryMetadataStore,
    barrier: Barrier,
    lookups: AtomicUsize,
}

#[async_trait]
impl RecordingStore for RacingStore {
    async fn insert_recording(&self, recording: &Recording) -> Result<(), StoreError> {
        self.inner.insert_recording(recording).await
    }

    async fn find_recording(&self, key: &RecordingKey) -> Result<Option<Recording>, StoreError> {
        let found = self.inner.find_recording(key).await;
        if self.lookups.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait().await;
        }
        found
    }

    async fn mark_frozen(
        &self,
        key: &RecordingKey,
        frozen_at: chrono::DateTime<Utc>,
    ) -> Result<Option<Recording>, StoreError> {
        self.inner.mark_frozen(key, frozen_at).await
    }

    async fn list_recordings_since(
        &self,
        location_code: &str,
        status: RecordingStatus,
        since: chrono::DateTime<Utc>,
    ) -> Result<Vec<Recording>, StoreError> {
        self.inner
            .list_recordings_since(location_code, status, since)
            .await
    }
}

#[tokio::test]
async fn test_concurrent_ensure_creates_one_recording() {
    let store = Arc::new(RacingStore {
        inner: MemoryMetadataStore::new(),
        barrier: Barrier::new(2),
        lookups: AtomicUsize::new(0),
    });
    let objects = Arc::new(MemoryObjectStore::new());
    let configs: Arc<dyn ConfigProvider> =
        Arc::new(ObjectStoreConfigProvider::new(objects.clone()));
    let images = Arc::new(MemoryMetadataStore::new());
    let lifecycle = RecordingLifecycle::new(
        store.clone(),
        images,
        configs.clone(),
        Arc::new(CountingReports {
            inner: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }),
        Arc::new(inspection_service::notify::NoopNotifier),
    );

    let key = RecordingKey::new("L2", "R2").unwrap();
    let (first, second) = tokio::join!(
        lifecycle.ensure_recording(&key),
        lifecycle.ensure_recording(&key)
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.status, RecordingStatus::Partial);
    assert_eq!(store.inner.recording_count().await, 1);
}

#[tokio::test]
async fn test_page_completeness_only_grows() {
    let h = harness(HarnessOptions::default()).await;

    let page = h.service.get_or_render_recording("L1", "R7").await.unwrap();
    assert_eq!(page.completeness.missing.len(), 6);
    assert!(page.is_partial);
    assert!(!page.degraded);
    assert!(page.views.iter().all(|v| v.url.is_none()));

    let mut previous = page.completeness.missing.len();
    for view in ["C", "C", "A", "F", "B", "E", "D"] {
        upload_views(&h.service, "L1", "R7", &[view]).await;
        let page = h.service.get_or_render_recording("L1", "R7").await.unwrap();
        assert!(page.completeness.missing.len() <= previous);
        previous = page.completeness.missing.len();
    }
    assert_eq!(previous, 0);

    h.service.freeze_recording("L1", "R7").await.unwrap();
    let page = h.service.get_or_render_recording("L1", "R7").await.unwrap();
    assert!(page.completeness.complete);
    assert!(!page.is_partial);
    assert!(page.views.iter().all(|v| v.url.is_some()));
    let report_url = page.report_url.expect("frozen page links the report");
    assert!(report_url.url.starts_with("memory://content/L1/R7/R7.report"));
}

#[tokio::test]
async fn test_page_degrades_without_manifest() {
    let h = harness(HarnessOptions::default()).await;

    let page = h.service.get_or_render_recording("L9", "R1").await.unwrap();

    assert!(page.degraded);
    assert!(page.views.is_empty());
    assert!(!page.completeness.complete);
    assert_eq!(h.metadata.recording_count().await, 1);
}

#[tokio::test]
async fn test_invalid_identifiers_are_rejected() {
    let h = harness(HarnessOptions::default()).await;

    let err = h
        .service
        .record_upload("L1", "../R1", "A", tiny_jpeg())
        .await
        .unwrap_err();
    assert!(err.is_client_error());

    let err = h
        .service
        .record_upload("L1", "R1", "A", b"plain text".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, InspectionError::Validation(_)));
    assert_eq!(h.metadata.recording_count().await, 0);
}

#[tokio::test]
async fn test_encoded_upload() {
    use base64::Engine;

    let h = harness(HarnessOptions::default()).await;
    let payload = format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(tiny_jpeg())
    );

    let receipt = h
        .service
        .record_upload_encoded("L1", "R3", "B", &payload)
        .await
        .unwrap();

    assert_eq!(receipt.object_key, "content/L1/R3/B.jpg");
    assert_eq!(
        h.objects.get_object("content/L1/R3/B.jpg").await.unwrap(),
        tiny_jpeg()
    );
}

#[tokio::test]
async fn test_regenerate_requires_frozen_recording() {
    let h = harness(HarnessOptions::default()).await;

    let missing = h.service.regenerate_report("L1", "R1").await.unwrap_err();
    assert!(matches!(missing, InspectionError::NotFound(_)));

    upload_views(&h.service, "L1", "R1", &VIEWS).await;
    let partial = h.service.regenerate_report("L1", "R1").await.unwrap_err();
    assert!(matches!(partial, InspectionError::Validation(_)));

    h.service.freeze_recording("L1", "R1").await.unwrap();
    let artifact = h.service.regenerate_report("L1", "R1").await.unwrap();
    assert_eq!(artifact.object_key, "content/L1/R1/R1.report");
    assert_eq!(artifact.page_count, 4);
    assert_eq!(h.reports.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_recent_recordings_split_by_status() {
    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;
    h.service.freeze_recording("L1", "R1").await.unwrap();
    upload_views(&h.service, "L1", "R2", &["A"]).await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    upload_views(&h.service, "L1", "R3", &["B"]).await;
    upload_views(&h.service, "L2", "R4", &["B"]).await;

    let recent = h
        .service
        .recent_recordings("L1", chrono::Duration::days(30))
        .await
        .unwrap();

    assert_eq!(recent.partial_count, 2);
    assert_eq!(recent.frozen_count, 1);
    assert_eq!(recent.partial[0].recording_ref, "R3");
    assert_eq!(recent.frozen[0].recording_ref, "R1");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_does_not_undo_freeze() {
    let h = harness(HarnessOptions {
        report_delay: Some(Duration::from_secs(30)),
        request_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    })
    .await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    assert_eq!(
        stored_recording(&h.metadata, "L1", "R1").await.status,
        RecordingStatus::Frozen
    );
    let key = RecordingKey::new("L1", "R1").unwrap();
    assert!(h.objects.contains(&key.report_object_key()).await);
    assert_eq!(h.transport.sent.lock().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_report_is_cut_off_but_freeze_stands() {
    let h = harness(HarnessOptions {
        report_delay: Some(Duration::from_secs(30)),
        report_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    })
    .await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    assert_eq!(
        stored_recording(&h.metadata, "L1", "R1").await.status,
        RecordingStatus::Frozen
    );
    let key = RecordingKey::new("L1", "R1").unwrap();
    assert!(!h.objects.contains(&key.report_object_key()).await);
    assert!(h.transport.sent.lock().await.is_empty());

    // The report can still be produced on demand
    h.service.regenerate_report("L1", "R1").await.unwrap();
    assert!(h.objects.contains(&key.report_object_key()).await);
}

#[tokio::test]
async fn test_freeze_reports_with_microsecond_timestamps() {
    use chrono::Timelike;

    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    let outcome = h.service.freeze_recording("L1", "R1").await.unwrap();

    assert_eq!(outcome, FreezeOutcome::FrozenNow);
    let stored = stored_recording(&h.metadata, "L1", "R1").await;
    let frozen_at = stored.frozen_at.unwrap();
    assert_eq!(frozen_at.nanosecond() % 1_000, 0);
    assert_eq!(stored.created_at.nanosecond() % 1_000, 0);
    assert_eq!(h.reports.calls.load(Ordering::SeqCst), 1);
    let key = RecordingKey::new("L1", "R1").unwrap();
    assert!(h.objects.contains(&key.report_object_key()).await);
}

#[tokio::test]
async fn test_concurrent_freezes_report_once() {
    let h = harness(HarnessOptions::default()).await;
    upload_views(&h.service, "L1", "R1", &VIEWS).await;

    let (first, second) = tokio::join!(
        h.service.freeze_recording("L1", "R1"),
        h.service.freeze_recording("L1", "R1")
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| *o == FreezeOutcome::FrozenNow);

    assert_eq!(
        outcomes,
        vec![FreezeOutcome::AlreadyFrozen, FreezeOutcome::FrozenNow]
    );
    assert_eq!(h.reports.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_png_upload_is_stored_as_jpeg() {
    let h = harness(HarnessOptions::default()).await;
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, image::Rgb([10, 200, 40])))
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();

    let receipt = h.service.record_upload("L1", "R1", "A", png).await.unwrap();

    let stored = h.objects.get_object(&receipt.object_key).await.unwrap();
    assert_eq!(image::guess_format(&stored).unwrap(), ImageFormat::Jpeg);
    assert_eq!(
        h.objects.content_type(&receipt.object_key).await.as_deref(),
        Some("image/jpeg")
    );
    assert!(receipt.object_key.ends_with(".jpg"));
}
