//! Delayed, single-attempt delivery of payment-result notifications.
//!
//! ```text
//! schedule(job)
//!   └─ spawn ─► Scheduled ── sleep(delay) ──► Delivering ── POST ──► Delivered
//!                  │                                           └───► Failed
//!                  └─ cancelled (handle / shutdown) ──► Cancelled
//! ```
//!
//! A job makes exactly one delivery attempt. A transport error and an acknowledgement whose
//! `return_code` is not `SUCCESS` both end in `Failed`, which is logged and dropped. The real
//! provider retries on an escalating schedule; this simulation does not.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::codec;
use crate::errors::{CallbackError, Error, Result};
use crate::fields::RETURN_MSG;

pub const NOTIFY_CONTENT_TYPE: &str = "application/xml";

/// A signed payload waiting to be pushed to a callback URL.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub url: String,
    pub content_type: String,
    pub payload: Bytes,
    pub delay: Duration,
}

impl NotificationJob {
    pub fn new(url: impl Into<String>, payload: impl Into<Bytes>, delay: Duration) -> Self {
        Self {
            url: url.into(),
            content_type: NOTIFY_CONTENT_TYPE.to_string(),
            payload: payload.into(),
            delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Delivering,
    Delivered,
    Failed,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Owner of a scheduled job. Dropping it does not cancel the job.
#[derive(Debug)]
pub struct NotificationHandle {
    id: Uuid,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl NotificationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the job if it is still waiting out its delay. An attempt already in flight
    /// completes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    http: reqwest::Client,
    root: CancellationToken,
}

impl NotificationDispatcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            root: CancellationToken::new(),
        }
    }

    /// Build a dispatcher whose callback requests give up after `timeout`, or never time out
    /// on their own when it is `None`.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| Error::Config {
            message: format!("failed to build notification HTTP client: {e}"),
        })?;
        Ok(Self::new(http))
    }

    /// Spawn `job` on its own task. Returns immediately.
    pub fn schedule(&self, job: NotificationJob) -> NotificationHandle {
        let id = Uuid::new_v4();
        let token = self.root.child_token();

        tracing::debug!(
            job_id = %id,
            url = %job.url,
            delay_ms = job.delay.as_millis() as u64,
            state = %JobState::Scheduled,
            "Notification scheduled"
        );

        let task = tokio::spawn(run_job(id, self.http.clone(), job, token.clone()));
        NotificationHandle { id, token, task }
    }

    /// Cancel every job still waiting out its delay.
    pub fn shutdown(&self) {
        tracing::debug!("Cancelling pending notifications");
        self.root.cancel();
    }

    /// [`shutdown`](Self::shutdown) when the returned guard is dropped.
    pub fn shutdown_on_drop(&self) -> DropGuard {
        self.root.clone().drop_guard()
    }
}

async fn run_job(id: Uuid, http: reqwest::Client, job: NotificationJob, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {
            tracing::debug!(job_id = %id, state = %JobState::Cancelled, "Notification cancelled before delivery");
            return;
        }
        _ = tokio::time::sleep(job.delay) => {}
    }

    tracing::debug!(job_id = %id, url = %job.url, state = %JobState::Delivering, "Delivering notification");
    match deliver(&http, &job).await {
        Ok(()) => {
            tracing::info!(job_id = %id, url = %job.url, state = %JobState::Delivered, "Notification delivered");
        }
        Err(e) => {
            tracing::warn!(job_id = %id, url = %job.url, state = %JobState::Failed, error = %e, "Notification delivery failed");
        }
    }
}

/// POST the job's payload once and interpret the acknowledgement.
pub async fn deliver(http: &reqwest::Client, job: &NotificationJob) -> std::result::Result<(), CallbackError> {
    if job.url.is_empty() {
        return Err(CallbackError::MissingUrl);
    }

    let transport = |source| CallbackError::Transport {
        url: job.url.clone(),
        source,
    };
    let response = http
        .post(&job.url)
        .header(CONTENT_TYPE, &job.content_type)
        .body(job.payload.clone())
        .send()
        .await
        .map_err(transport)?;
    let body = response.bytes().await.map_err(transport)?;

    let ack = codec::decode(&body).map_err(CallbackError::Decode)?;
    if ack.is_return_success() {
        Ok(())
    } else {
        Err(CallbackError::NotAcknowledged {
            return_msg: ack.get_or_empty(RETURN_MSG).to_string(),
        })
    }
}
