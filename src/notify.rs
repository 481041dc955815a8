use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::limits::HUB_CHANNEL_CAPACITY;
use crate::model::{Ms, format_rfc3339};
use crate::observability;

/// What a member is told about one booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub member_name: String,
    /// `None` for staff reservations with no member attached.
    pub member_email: Option<String>,
    pub instructor_name: String,
    pub starts_at: Ms,
    pub issued_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Created,
    Cancelled,
    Reminder,
}

impl NoticeKind {
    fn label(self) -> &'static str {
        match self {
            NoticeKind::Created => "created",
            NoticeKind::Cancelled => "cancelled",
            NoticeKind::Reminder => "reminder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound member messaging (email). Implementations may fail; callers only log it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_created(&self, notice: &Notice) -> Result<(), NotifyError>;
    async fn booking_cancelled(&self, notice: &Notice) -> Result<(), NotifyError>;
    async fn reminder(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Writes notices to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn booking_created(&self, notice: &Notice) -> Result<(), NotifyError> {
        log_notice("booking confirmed", notice);
        Ok(())
    }

    async fn booking_cancelled(&self, notice: &Notice) -> Result<(), NotifyError> {
        log_notice("booking cancelled", notice);
        Ok(())
    }

    async fn reminder(&self, notice: &Notice) -> Result<(), NotifyError> {
        log_notice("booking reminder", notice);
        Ok(())
    }
}

fn log_notice(subject: &str, notice: &Notice) {
    tracing::info!(
        to = notice.member_email.as_deref().unwrap_or("-"),
        member = %notice.member_name,
        instructor = %notice.instructor_name,
        slot = %format_rfc3339(notice.starts_at),
        "{subject}"
    );
}

async fn send(notifier: &dyn Notifier, kind: NoticeKind, notice: &Notice) -> Result<(), NotifyError> {
    let result = match kind {
        NoticeKind::Created => notifier.booking_created(notice).await,
        NoticeKind::Cancelled => notifier.booking_cancelled(notice).await,
        NoticeKind::Reminder => notifier.reminder(notice).await,
    };
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::NOTIFICATIONS_TOTAL, "channel" => kind.label(), "status" => status)
        .increment(1);
    result
}

// ── Pub/sub fan-out ──────────────────────────────────────

/// JSON payload pushed to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub user_name: String,
    pub slot_time: String,
    pub timestamp: String,
}

impl HubMessage {
    fn from_notice(kind: NoticeKind, notice: &Notice) -> Option<Self> {
        let (kind, verb) = match kind {
            NoticeKind::Created => ("booking_created", "booked"),
            NoticeKind::Cancelled => ("booking_deleted", "cancelled"),
            NoticeKind::Reminder => return None,
        };
        let slot_time = format_rfc3339(notice.starts_at);
        Some(Self {
            kind,
            message: format!(
                "{} {verb} {} with {}",
                notice.member_name, slot_time, notice.instructor_name
            ),
            user_name: notice.member_name.clone(),
            slot_time,
            timestamp: format_rfc3339(notice.issued_at),
        })
    }
}

/// Broadcast hub: one firehose plus one channel per instructor.
pub struct NotifyHub {
    all: broadcast::Sender<String>,
    channels: DashMap<Ulid, broadcast::Sender<String>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(HUB_CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<String> {
        self.all.subscribe()
    }

    /// Subscribe to one instructor's bookings. Creates the channel if needed.
    pub fn subscribe(&self, instructor_id: Ulid) -> broadcast::Receiver<String> {
        self.channels
            .entry(instructor_id)
            .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a message. No-op if nobody is listening.
    pub fn publish(&self, instructor_id: Ulid, message: &HubMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("hub: cannot encode message: {e}");
                return;
            }
        };
        if let Some(sender) = self.channels.get(&instructor_id) {
            let _ = sender.send(payload.clone());
        }
        let _ = self.all.send(payload);
        metrics::counter!(observability::NOTIFICATIONS_TOTAL, "channel" => "hub", "status" => "ok")
            .increment(1);
    }
}

// ── Bounded dispatcher ───────────────────────────────────

struct Job {
    kind: NoticeKind,
    notice: Notice,
}

/// Queue in front of the notifier. Submitting never waits; delivery runs on a
/// worker with at most `concurrency` sends in flight.
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    notifier: Arc<dyn Notifier>,
    hub: Arc<NotifyHub>,
}

impl Dispatcher {
    /// Spawn the delivery worker. It exits once every `Dispatcher` handle is dropped
    /// and the queue has drained.
    pub fn start(
        notifier: Arc<dyn Notifier>,
        hub: Arc<NotifyHub>,
        queue: usize,
        concurrency: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let worker = tokio::spawn(run_worker(rx, notifier.clone(), concurrency.max(1)));
        (Self { tx, notifier, hub }, worker)
    }

    pub fn hub(&self) -> &Arc<NotifyHub> {
        &self.hub
    }

    /// Publish to the hub and enqueue the email. Drops the email if the queue is full.
    pub fn submit(&self, kind: NoticeKind, instructor_id: Ulid, notice: Notice) {
        if let Some(message) = HubMessage::from_notice(kind, &notice) {
            self.hub.publish(instructor_id, &message);
        }
        if notice.member_email.is_none() {
            return;
        }
        if let Err(e) = self.tx.try_send(Job { kind, notice }) {
            metrics::counter!(observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
            match e {
                mpsc::error::TrySendError::Full(job) => tracing::warn!(
                    kind = kind.label(),
                    slot = %format_rfc3339(job.notice.starts_at),
                    "notification queue full, dropping"
                ),
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!(kind = kind.label(), "notification worker stopped, dropping")
                }
            }
        }
    }

    /// Publish and deliver inline, returning the notifier's verdict.
    pub async fn deliver_now(&self, kind: NoticeKind, instructor_id: Ulid, notice: &Notice) -> Result<(), NotifyError> {
        if let Some(message) = HubMessage::from_notice(kind, notice) {
            self.hub.publish(instructor_id, &message);
        }
        send(self.notifier.as_ref(), kind, notice).await
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Job>, notifier: Arc<dyn Notifier>, concurrency: usize) {
    let limit = Arc::new(Semaphore::new(concurrency));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let notifier = notifier.clone();
        tokio::spawn(async move {
            let _permit = permit; // held until this send finishes
            if let Err(e) = send(notifier.as_ref(), job.kind, &job.notice).await {
                tracing::warn!(
                    kind = job.kind.label(),
                    slot = %format_rfc3339(job.notice.starts_at),
                    "{e}"
                );
            }
        });
    }
    // Wait for in-flight sends.
    let _ = limit.acquire_many(concurrency as u32).await;
}
