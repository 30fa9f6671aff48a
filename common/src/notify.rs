// Outbound notifications: failed runs and the daily summary.
// Delivery is best effort; callers never wait on it for correctness.

use crate::config::NotificationConfig;
use crate::models::{DailySummary, JobKind, JobRun};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the hex HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "X-Backup-Signature";

type HmacSha256 = Hmac<Sha256>;

/// A failed run, as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub kind: JobKind,
    pub resource_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub error_message: String,
}

impl FailureNotice {
    pub fn from_run(run: &JobRun, job_name: &str, resource_key: Option<&str>) -> Self {
        Self {
            run_id: run.id,
            job_id: run.job_id,
            job_name: job_name.to_string(),
            kind: run.kind,
            resource_key: resource_key.map(str::to_string),
            started_at: run.started_at,
            error_message: run
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }
}

/// Notifier delivers operator notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<()>;

    async fn notify_daily_summary(&self, summary: &DailySummary) -> Result<()>;
}

/// Send a failure notice without waiting for delivery
pub fn spawn_failure_notice(notifier: Arc<dyn Notifier>, notice: FailureNotice) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_failure(&notice).await {
            warn!(
                job_id = %notice.job_id,
                run_id = %notice.run_id,
                error = %e,
                "Failure notification not delivered"
            );
        }
    });
}

/// LogNotifier writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<()> {
        error!(
            job_id = %notice.job_id,
            job_name = %notice.job_name,
            kind = %notice.kind,
            run_id = %notice.run_id,
            error = %notice.error_message,
            "Job run failed"
        );
        Ok(())
    }

    async fn notify_daily_summary(&self, summary: &DailySummary) -> Result<()> {
        info!(
            date = %summary.date,
            total_runs = summary.total_runs,
            succeeded = summary.succeeded,
            failed = summary.failed,
            partial = summary.partial,
            bytes_backed_up = summary.bytes_backed_up,
            "Daily summary"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    sent_at: DateTime<Utc>,
    data: &'a T,
}

/// WebhookNotifier POSTs signed JSON to an HTTP endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }

    async fn post<T: Serialize + Sync>(&self, event: &str, data: &T) -> Result<()> {
        let body = serde_json::to_vec(&Envelope {
            event,
            sent_at: Utc::now(),
            data,
        })?;

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .with_context(|| format!("webhook {} unreachable", self.url))?;
        response
            .error_for_status()
            .with_context(|| format!("webhook {} rejected {}", self.url, event))?;
        Ok(())
    }
}

/// Hex HMAC-SHA256 of `body`
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, notice), fields(job_id = %notice.job_id))]
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<()> {
        self.post("job_failed", notice).await
    }

    #[instrument(skip(self, summary), fields(date = %summary.date))]
    async fn notify_daily_summary(&self, summary: &DailySummary) -> Result<()> {
        self.post("daily_summary", summary).await
    }
}

/// Webhook notifier when a URL is configured, log notifier otherwise
pub fn from_config(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) if !url.is_empty() => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            config.webhook_secret.clone(),
            Duration::from_secs(config.timeout_seconds),
        )?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunMetrics, RunStatus, TriggerSource};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn failed_run() -> JobRun {
        let mut run = JobRun::start(Uuid::new_v4(), JobKind::Backup, TriggerSource::Scheduled);
        run.finish(
            RunStatus::Failed,
            RunMetrics::default(),
            Some("disk full".to_string()),
        );
        run
    }

    #[test]
    fn test_notice_from_run() {
        let run = failed_run();
        let notice = FailureNotice::from_run(&run, "nightly", Some("sales"));
        assert_eq!(notice.error_message, "disk full");
        assert_eq!(notice.resource_key.as_deref(), Some("sales"));
        assert_eq!(notice.kind, JobKind::Backup);
    }

    #[test]
    fn test_sign_is_deterministic_hex() {
        let a = sign("secret", b"payload").unwrap();
        let b = sign("secret", b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign("other", b"payload").unwrap());
    }

    #[tokio::test]
    async fn test_webhook_posts_signed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/backup"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            format!("{}/hooks/backup", server.uri()),
            Some("s3cret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let notice = FailureNotice::from_run(&failed_run(), "nightly", Some("sales"));
        notifier.notify_failure(&notice).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let signature = request
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(signature, sign("s3cret", &request.body).unwrap());

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["event"], "job_failed");
        assert_eq!(body["data"]["error_message"], "disk full");
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let notice = FailureNotice::from_run(&failed_run(), "nightly", None);
        assert!(notifier.notify_failure(&notice).await.is_err());
    }

    #[test]
    fn test_from_config_falls_back_to_log() {
        assert!(from_config(&NotificationConfig::default()).is_ok());
    }
}
