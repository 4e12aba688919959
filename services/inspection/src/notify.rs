//! Best-effort email notification once a report is ready.
//!
//! Nothing here returns an error to the lifecycle: a missing recipient list, a failed
//! signature or a rejected email is logged and counted, and the freeze stands.

use crate::config::NotificationConfig;
use crate::models::RecordingKey;
use crate::object_store::ObjectStore;
use crate::report::ReportArtifact;
use crate::site_config::ConfigProvider;
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors raised by a notification transport
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("email gateway request failed: {0}")]
    Request(String),

    #[error("email gateway rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// One outgoing email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Delivers composed emails
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    from: &'a str,
    to: String,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

/// Transport posting to the HTTP email gateway
pub struct HttpEmailTransport {
    client: reqwest::Client,
    endpoint: String,
    sender: String,
    authorization: String,
}

impl HttpEmailTransport {
    pub fn new(config: &NotificationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build email gateway client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            sender: config.sender.clone(),
            authorization: format!("AICUE {}:{}", config.app_key, config.app_secret),
        })
    }
}

#[async_trait]
impl NotificationTransport for HttpEmailTransport {
    #[instrument(skip(self, message), fields(recipients = message.recipients.len()))]
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        let body = GatewayRequest {
            from: &self.sender,
            to: message.recipients.join(", "),
            subject: &message.subject,
            text: &message.text,
            html: &message.html,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(status = status.as_u16(), "Email accepted by gateway");
        Ok(())
    }
}

/// Told about every report that was generated successfully
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn report_ready(&self, key: &RecordingKey, report: &ReportArtifact);
}

/// Notifier that does nothing, for deployments with notification disabled
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn report_ready(&self, key: &RecordingKey, _report: &ReportArtifact) {
        info!(recording = %key, "Notification disabled, skipping");
    }
}

/// Emails each location's recipients a signed link to the new report
pub struct NotificationDispatcher {
    configs: Arc<dyn ConfigProvider>,
    objects: Arc<dyn ObjectStore>,
    transport: Arc<dyn NotificationTransport>,
    link_expiry: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        configs: Arc<dyn ConfigProvider>,
        objects: Arc<dyn ObjectStore>,
        transport: Arc<dyn NotificationTransport>,
        link_expiry: Duration,
    ) -> Self {
        Self {
            configs,
            objects,
            transport,
            link_expiry,
        }
    }

    async fn try_notify(
        &self,
        key: &RecordingKey,
        report: &ReportArtifact,
    ) -> anyhow::Result<usize> {
        let recipients = self
            .configs
            .recipients(&key.location_code)
            .await
            .context("Failed to load recipients")?;
        let link = self
            .objects
            .presigned_get_url(&report.object_key, self.link_expiry)
            .await
            .context("Failed to sign report link")?;

        let message = compose_message(key, recipients.as_slice().to_vec(), &link.url);
        self.transport
            .send(&message)
            .await
            .context("Failed to send email")?;
        Ok(message.recipients.len())
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    #[instrument(skip(self, report), fields(recording = %key))]
    async fn report_ready(&self, key: &RecordingKey, report: &ReportArtifact) {
        match self.try_notify(key, report).await {
            Ok(sent_to) => {
                metrics::counter!("inspection.notifications.sent").increment(1);
                info!(recipients = sent_to, "Report notification sent");
            }
            Err(e) => {
                metrics::counter!("inspection.notifications.failed").increment(1);
                warn!(error = format!("{e:#}"), "Report notification failed");
            }
        }
    }
}

/// Build the plain-text and HTML bodies announcing a report
pub fn compose_message(key: &RecordingKey, recipients: Vec<String>, link: &str) -> EmailMessage {
    let subject = format!(
        "Inspection report ready: {} ({})",
        key.recording_ref, key.location_code
    );
    let text = format!(
        "The inspection report for recording {} at location {} is ready.\n\n\
         Download it here: {}\n\nThis link expires in 24 hours.\n",
        key.recording_ref, key.location_code, link
    );
    let html = format!(
        "<p>The inspection report for recording <b>{}</b> at location <b>{}</b> is ready.</p>\
         <p><a href=\"{}\">Download the report</a></p>\
         <p>This link expires in 24 hours.</p>",
        escape_html(&key.recording_ref),
        escape_html(&key.location_code),
        escape_html(link)
    );

    EmailMessage {
        recipients,
        subject,
        text,
        html,
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use crate::site_config::{ConfigError, RecipientList, ReportTemplate, ViewManifest};

    struct StaticConfigs {
        recipients: Option<Vec<String>>,
    }

    #[async_trait]
    impl ConfigProvider for StaticConfigs {
        async fn view_manifest(&self, location_code: &str) -> Result<ViewManifest, ConfigError> {
            Err(missing(location_code, "views"))
        }

        async fn report_template(
            &self,
            location_code: &str,
        ) -> Result<ReportTemplate, ConfigError> {
            Err(missing(location_code, "template"))
        }

        async fn recipients(&self, location_code: &str) -> Result<RecipientList, ConfigError> {
            match &self.recipients {
                Some(list) => Ok(RecipientList::new(list.clone()).unwrap()),
                None => Err(missing(location_code, "recipients")),
            }
        }
    }

    fn missing(location: &str, document: &str) -> ConfigError {
        ConfigError::Missing {
            location: location.to_string(),
            document: document.to_string(),
        }
    }

    fn key() -> RecordingKey {
        RecordingKey::new("L1", "R1").unwrap()
    }

    fn artifact() -> ReportArtifact {
        ReportArtifact {
            object_key: "content/L1/R1/R1.report".to_string(),
            page_count: 4,
            size_bytes: 1024,
        }
    }

    fn dispatcher(
        recipients: Option<Vec<String>>,
        transport: MockNotificationTransport,
    ) -> NotificationDispatcher {
        NotificationDispatcher::new(
            Arc::new(StaticConfigs { recipients }),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(transport),
            Duration::from_secs(24 * 3600),
        )
    }

    #[test]
    fn test_compose_message() {
        let message = compose_message(
            &key(),
            vec!["ops@example.com".to_string()],
            "https://bucket/report?a=1&b=2",
        );

        assert_eq!(message.subject, "Inspection report ready: R1 (L1)");
        assert!(message.text.contains("https://bucket/report?a=1&b=2"));
        assert!(message.html.contains("href=\"https://bucket/report?a=1&amp;b=2\""));
        assert_eq!(message.recipients, vec!["ops@example.com"]);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>\"A&B\"</b>"), "&lt;b&gt;&quot;A&amp;B&quot;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_sends_to_all_recipients() {
        let mut transport = MockNotificationTransport::new();
        transport
            .expect_send()
            .withf(|message| {
                message.recipients == vec!["a@example.com", "b@example.com"]
                    && message.text.contains("memory://content/L1/R1/R1.report")
            })
            .times(1)
            .returning(|_| Ok(()));

        let dispatcher = dispatcher(
            Some(vec!["a@example.com".to_string(), "b@example.com".to_string()]),
            transport,
        );
        dispatcher.report_ready(&key(), &artifact()).await;
    }

    #[tokio::test]
    async fn test_transport_failure_is_absorbed() {
        let mut transport = MockNotificationTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Err(NotifyError::Rejected {
                status: 502,
                body: "bad gateway".to_string(),
            })
        });

        let dispatcher = dispatcher(Some(vec!["a@example.com".to_string()]), transport);
        dispatcher.report_ready(&key(), &artifact()).await;
    }

    #[tokio::test]
    async fn test_missing_recipients_skips_send() {
        let mut transport = MockNotificationTransport::new();
        transport.expect_send().never();

        let dispatcher = dispatcher(None, transport);
        dispatcher.report_ready(&key(), &artifact()).await;
    }
}
