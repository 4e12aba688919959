//! In-process store implementations for tests and local runs.

use crate::metadata_store::{ImageStore, RecordingStore, StoreError};
use crate::models::{stored_precision, Image, Recording, RecordingKey, RecordingStatus};
use crate::object_store::{expiry_from_now, ObjectStore, ObjectStoreError, SignedUrl};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Recording and image tables held in memory, with the same uniqueness rules and
/// timestamp precision as the database schema
#[derive(Default)]
pub struct MemoryMetadataStore {
    recordings: Mutex<HashMap<RecordingKey, Recording>>,
    images: Mutex<HashMap<(RecordingKey, String), Image>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recording_count(&self) -> usize {
        self.recordings.lock().await.len()
    }

    pub async fn image_count(&self, key: &RecordingKey) -> usize {
        self.images
            .lock()
            .await
            .keys()
            .filter(|(k, _)| k == key)
            .count()
    }
}

#[async_trait]
impl RecordingStore for MemoryMetadataStore {
    async fn insert_recording(&self, recording: &Recording) -> Result<(), StoreError> {
        let mut recordings = self.recordings.lock().await;
        let key = recording.key();
        if recordings.contains_key(&key) {
            return Err(StoreError::Conflict(format!("recording {key} exists")));
        }
        let mut stored = recording.clone();
        stored.created_at = stored_precision(stored.created_at);
        stored.frozen_at = stored.frozen_at.map(stored_precision);
        recordings.insert(key, stored);
        Ok(())
    }

    async fn find_recording(&self, key: &RecordingKey) -> Result<Option<Recording>, StoreError> {
        Ok(self.recordings.lock().await.get(key).cloned())
    }

    async fn mark_frozen(
        &self,
        key: &RecordingKey,
        frozen_at: DateTime<Utc>,
    ) -> Result<Option<Recording>, StoreError> {
        let mut recordings = self.recordings.lock().await;
        Ok(recordings
            .get_mut(key)
            .filter(|recording| recording.status == RecordingStatus::Partial)
            .map(|recording| {
                recording.status = RecordingStatus::Frozen;
                recording.frozen_at = Some(stored_precision(frozen_at));
                recording.clone()
            }))
    }

    async fn list_recordings_since(
        &self,
        location_code: &str,
        status: RecordingStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Recording>, StoreError> {
        let mut matching: Vec<Recording> = self
            .recordings
            .lock()
            .await
            .values()
            .filter(|r| r.location_code == location_code && r.status == status)
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }
}

#[async_trait]
impl ImageStore for MemoryMetadataStore {
    async fn upsert_image(
        &self,
        key: &RecordingKey,
        view_name: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Image, StoreError> {
        let image = Image {
            location_code: key.location_code.clone(),
            recording_ref: key.recording_ref.clone(),
            view_name: view_name.to_string(),
            uploaded_at: stored_precision(uploaded_at),
        };
        self.images
            .lock()
            .await
            .insert((key.clone(), view_name.to_string()), image.clone());
        Ok(image)
    }

    async fn find_by_recording(&self, key: &RecordingKey) -> Result<Vec<Image>, StoreError> {
        let mut images: Vec<Image> = self
            .images
            .lock()
            .await
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, image)| image.clone())
            .collect();
        images.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(images)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
}

/// Object store held in memory. Signed URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    failing_gets: Mutex<HashMap<String, u32>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a JSON document, as config documents are stored
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: "application/json".to_string(),
            },
        );
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }

    pub async fn remove(&self, key: &str) {
        self.objects.lock().await.remove(key);
    }

    /// Make the next `times` reads of `key` fail as if the store were unreachable
    pub async fn fail_next_gets(&self, key: &str, times: u32) {
        self.failing_gets
            .lock()
            .await
            .insert(key.to_string(), times);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        {
            let mut failing = self.failing_gets.lock().await;
            if let Some(remaining) = failing.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ObjectStoreError::Request {
                        operation: "get_object",
                        key: key.to_string(),
                        message: "injected failure".to_string(),
                    });
                }
            }
        }

        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<SignedUrl, ObjectStoreError> {
        Ok(SignedUrl {
            url: format!("memory://{key}?expires={}", expires_in.as_secs()),
            expires_at: expiry_from_now(expires_in),
        })
    }
}
