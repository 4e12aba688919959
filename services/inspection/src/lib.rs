//! Inspection Service
//!
//! Container inspection recordings for gate and yard locations. Operators photograph a
//! container from every view a location requires; once all views are in, the recording is
//! frozen, a PDF report is rendered from the photographs and the location's recipients are
//! emailed a link to it.
//!
//! ## Features
//!
//! - **Idempotent Intake**: re-uploading a view overwrites it, never duplicates it
//! - **Completeness-Gated Freeze**: a recording freezes only when every required view
//!   is present, and only once
//! - **Resilient Report Rendering**: view images are downloaded concurrently with
//!   exponential-backoff retries and laid out two per page behind a cover page
//! - **Best-Effort Notification**: report links are emailed without ever putting the
//!   freeze at risk
//!
//! ## Architecture
//!
//! ```text
//!   upload / view / freeze
//!            │
//!            ▼
//! ┌────────────────────┐      ┌──────────────┐      PostgreSQL
//! │ InspectionService  │─────▶│ Recording    │─────▶ recordings
//! └────────────────────┘      │ Lifecycle    │       images
//!            │                └──────────────┘
//!            │                       │ frozen now
//!            ▼                       ▼
//!        S3 Bucket            ┌──────────────┐      ┌──────────────┐
//!   content/{loc}/{ref}/ ◀────│ Report       │─────▶│ Notification │──▶ email
//!   configs/{loc}/       ────▶│ Generator    │      │ Dispatcher   │
//!                             └──────────────┘      └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod metadata_store;
pub mod models;
pub mod notify;
pub mod object_store;
pub mod report;
pub mod retry;
pub mod service;
pub mod site_config;

pub use config::Config;
pub use error::InspectionError;
pub use lifecycle::{Completeness, RecordingLifecycle};
pub use metadata_store::{ImageStore, PgMetadataStore, RecordingStore, StoreError};
pub use models::{FreezeOutcome, Image, Recording, RecordingKey, RecordingStatus};
pub use notify::{NotificationDispatcher, NotificationTransport, Notifier};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use report::{ReportArtifact, ReportBuilder, ReportError, ReportGenerator};
pub use retry::{retry, RetryPolicy};
pub use service::{InspectionService, RecordingPage, UploadReceipt};
pub use site_config::{ConfigProvider, ObjectStoreConfigProvider};
