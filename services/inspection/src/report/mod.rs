//! Inspection report generation.
//!
//! A report is one cover page followed by one page per pair of required views, in
//! manifest order. All view images are downloaded concurrently before any page is
//! composed; a view that still fails after its retries aborts the whole report, so a
//! partial document is never written.

pub mod layout;
pub mod pdf;

use crate::models::RecordingKey;
use crate::object_store::{ObjectStore, ObjectStoreError, CONTENT_TYPE_PDF};
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::site_config::{ConfigError, ConfigProvider, ReportTemplate, ViewManifest, ViewSpec};
use async_trait::async_trait;
use futures::future::try_join_all;
use layout::{Align, Canvas, Font, ImageId};
use pdf::{render_pdf, EmbeddedImage, PdfError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised while producing a report
#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to download view {view} after {attempts} attempts: {source}")]
    ViewDownload {
        view: String,
        attempts: u32,
        #[source]
        source: ObjectStoreError,
    },

    #[error("view {view} is not a readable image: {message}")]
    InvalidImage { view: String, message: String },

    #[error(transparent)]
    Render(#[from] PdfError),

    #[error("failed to store report: {0}")]
    Upload(#[source] ObjectStoreError),
}

/// A report that has been written to the object store
#[derive(Debug, Clone, PartialEq)]
pub struct ReportArtifact {
    pub object_key: String,
    pub page_count: usize,
    pub size_bytes: usize,
}

/// Anything that can produce and store the report for a recording
#[async_trait]
pub trait ReportBuilder: Send + Sync {
    async fn build_report(&self, key: &RecordingKey) -> Result<ReportArtifact, ReportError>;
}

/// Views that share one report page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewPair<'a> {
    pub first: &'a ViewSpec,
    pub second: Option<&'a ViewSpec>,
}

/// Group required views two per page in manifest order; an odd last view gets a page
/// to itself
pub fn pair_views(manifest: &ViewManifest) -> Vec<ViewPair<'_>> {
    manifest
        .views()
        .chunks(2)
        .map(|chunk| ViewPair {
            first: &chunk[0],
            second: chunk.get(1),
        })
        .collect()
}

/// Caption printed under each view image
pub fn caption(view: &ViewSpec) -> String {
    format!("View {}: {}", view.id, view.description)
}

const IMAGE_MAX_WIDTH: f32 = 400.0;
const IMAGE_HEIGHT: f32 = 200.0;
const FIRST_IMAGE_Y: f32 = 80.0;
const IMAGE_SPACING: f32 = 60.0;

/// Renders reports from uploaded views and per-location config
pub struct ReportGenerator {
    objects: Arc<dyn ObjectStore>,
    configs: Arc<dyn ConfigProvider>,
    download_policy: RetryPolicy,
}

impl ReportGenerator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        configs: Arc<dyn ConfigProvider>,
        download_policy: RetryPolicy,
    ) -> Self {
        Self {
            objects,
            configs,
            download_policy,
        }
    }

    /// Download one view, retrying per the download policy
    async fn download_view(
        &self,
        key: &RecordingKey,
        view: &ViewSpec,
    ) -> Result<EmbeddedImage, ReportError> {
        let object_key = key.view_object_key(&view.id);
        let bytes = retry(&self.download_policy, &object_key, |attempt| {
            debug!(view = %view.id, attempt = attempt, "Downloading view image");
            self.objects.get_object(&object_key)
        })
        .await
        .map_err(|RetryError { attempts, last_error }| ReportError::ViewDownload {
            view: view.id.clone(),
            attempts,
            source: last_error,
        })?;

        EmbeddedImage::from_bytes(bytes).map_err(|e| ReportError::InvalidImage {
            view: view.id.clone(),
            message: e.to_string(),
        })
    }
}

/// Lay out the cover page and one page per view pair. `images[i]` belongs to
/// `manifest.views()[i]`.
pub fn compose_report(
    recording_ref: &str,
    manifest: &ViewManifest,
    template: &ReportTemplate,
    images: &[EmbeddedImage],
) -> Canvas {
    let mut canvas = Canvas::a4();

    // Cover page; long notes continue on extra pages that carry the footer too
    canvas
        .set_running_footer(&template.footer)
        .set_cursor_y(100.0)
        .set_font(Font::Helvetica, 20.0)
        .text(&template.header, Align::Center)
        .move_down(1.5)
        .set_font(Font::Helvetica, 16.0)
        .text(&template.title, Align::Center)
        .move_down(1.5)
        .set_font(Font::Helvetica, 14.0)
        .text(&template.subtitle_for(recording_ref), Align::Center)
        .move_down(2.0)
        .set_font(Font::Helvetica, 10.0)
        .text(&template.cover_note_1, Align::Justify)
        .move_down(1.0)
        .text(&template.cover_note_2, Align::Justify)
        .footer(&template.footer);

    let image_width = canvas.content_width().min(IMAGE_MAX_WIDTH);
    let image_x = (canvas.width() - image_width) / 2.0;
    let slots = [
        FIRST_IMAGE_Y,
        FIRST_IMAGE_Y + IMAGE_HEIGHT + IMAGE_SPACING,
    ];

    let mut index = 0;
    for pair in pair_views(manifest) {
        canvas.add_page();
        let views = std::iter::once(pair.first).chain(pair.second);
        for (view, slot_y) in views.zip(slots) {
            let image = &images[index];
            canvas
                .image_fit(
                    ImageId(index),
                    image.pixel_size(),
                    image_x,
                    slot_y,
                    image_width,
                    IMAGE_HEIGHT,
                )
                .set_font(Font::Helvetica, 10.0)
                .text_at(
                    &caption(view),
                    image_x,
                    slot_y + IMAGE_HEIGHT + 10.0,
                    image_width,
                    Align::Center,
                );
            index += 1;
        }
        canvas.footer(&template.footer);
    }

    canvas
}

#[async_trait]
impl ReportBuilder for ReportGenerator {
    #[instrument(skip(self), fields(recording = %key))]
    async fn build_report(&self, key: &RecordingKey) -> Result<ReportArtifact, ReportError> {
        let started = Instant::now();

        let manifest = self.configs.view_manifest(&key.location_code).await?;
        let template = self.configs.report_template(&key.location_code).await?;

        let images = try_join_all(
            manifest
                .views()
                .iter()
                .map(|view| self.download_view(key, view)),
        )
        .await?;

        let canvas = compose_report(&key.recording_ref, &manifest, &template, &images);
        let page_count = canvas.pages().len();
        let document = render_pdf(canvas.pages(), &images, canvas.width(), canvas.height())?;
        let size_bytes = document.len();

        let object_key = key.report_object_key();
        self.objects
            .put_object(&object_key, document, CONTENT_TYPE_PDF)
            .await
            .map_err(ReportError::Upload)?;

        metrics::counter!("inspection.reports.generated").increment(1);
        info!(
            object_key = %object_key,
            pages = page_count,
            size_bytes = size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Report generated"
        );

        Ok(ReportArtifact {
            object_key,
            page_count,
            size_bytes,
        })
    }
}
