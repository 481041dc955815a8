use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use futures::stream;
use tracing::{info, warn};

use crate::limits::REMINDER_CONCURRENCY;
use crate::model::*;
use crate::notify::NoticeKind;

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderReport {
    pub sent: usize,
    pub failed: usize,
}

impl Engine {
    /// Remind every member holding a SIMPLE booking on the UTC day containing `day`.
    pub async fn send_reminders(&self, day: Ms) -> Result<ReminderReport, EngineError> {
        let from = day.div_euclid(DAY) * DAY;
        let bookings = self.store.bookings_between(from, from + DAY).await?;

        let mut notices = Vec::new();
        for booking in bookings.iter().filter(|b| b.is_simple() && b.member_id.is_some()) {
            let notice = self.notice_for(booking).await;
            if notice.member_email.is_some() {
                notices.push((booking.instructor_id, notice));
            }
        }

        let sent = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        stream::iter(notices)
            .for_each_concurrent(REMINDER_CONCURRENCY, |(instructor_id, notice)| {
                let (sent, failed) = (&sent, &failed);
                async move {
                    match self
                        .dispatcher
                        .deliver_now(NoticeKind::Reminder, instructor_id, &notice)
                        .await
                    {
                        Ok(()) => {
                            sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(member = %notice.member_name, "reminder: {e}");
                        }
                    }
                }
            })
            .await;

        let report = ReminderReport {
            sent: sent.into_inner(),
            failed: failed.into_inner(),
        };
        info!(
            day = %format_rfc3339(from),
            sent = report.sent,
            failed = report.failed,
            "reminders sent"
        );
        Ok(report)
    }
}
