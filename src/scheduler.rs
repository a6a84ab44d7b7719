//! Periodic jobs: order checks, session keep-alive and the morning report.

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::browser::SessionManager;
use crate::commands::Dispatcher;
use crate::config::ScheduleSettings;
use crate::error::BotError;
use crate::intake::IntakePipeline;
use crate::notify::Notifier;
use crate::report::{kst, kst_now};
use crate::telegram::Connectivity;

/// Next occurrence of `hour:minute` Korean time strictly after `now`.
pub fn next_daily_run(
    now: DateTime<FixedOffset>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<FixedOffset>> {
    let at = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let local = now.with_timezone(&kst());
    let today = local.date_naive().and_time(at);
    let candidate = if today > local.naive_local() {
        today
    } else {
        local
            .date_naive()
            .checked_add_days(Days::new(1))?
            .and_time(at)
    };
    kst().from_local_datetime(&candidate).single()
}

pub struct Scheduler {
    settings: ScheduleSettings,
    intake: Arc<IntakePipeline>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    connectivity: Arc<Connectivity>,
    operator: Arc<dyn Notifier>,
}

impl Scheduler {
    pub fn new(
        settings: ScheduleSettings,
        intake: Arc<IntakePipeline>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<Dispatcher>,
        connectivity: Arc<Connectivity>,
        operator: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            intake,
            sessions,
            dispatcher,
            connectivity,
            operator,
        }
    }

    /// Spawns every job. Dropping or aborting the handles stops them.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().order_checks()),
            tokio::spawn(self.clone().keep_alive()),
            tokio::spawn(self.daily_report()),
        ]
    }

    /// First check runs right away.
    async fn order_checks(self: Arc<Self>) {
        let period = minutes(self.settings.order_check_mins);
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            when_online(&self.connectivity, "order check", || async {
                match self.intake.poll().await {
                    Ok(_) | Err(BotError::Busy(_)) => {}
                    Err(e) => tracing::warn!(error = %e, "Scheduled order check failed"),
                }
            })
            .await;
        }
    }

    async fn keep_alive(self: Arc<Self>) {
        let period = minutes(self.settings.keep_alive_mins);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            when_online(&self.connectivity, "keep-alive", || async {
                if let Err(e) = self.sessions.keep_alive().await {
                    tracing::warn!(error = %e, "Keep-alive cycle failed");
                }
            })
            .await;
        }
    }

    async fn daily_report(self: Arc<Self>) {
        let (hour, minute) = (
            self.settings.daily_report_hour,
            self.settings.daily_report_minute,
        );
        loop {
            let now = kst_now();
            let Some(next) = next_daily_run(now, hour, minute) else {
                tracing::error!(hour, minute, "Invalid daily report time, job disabled");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            tracing::info!(next = %next, "Daily report scheduled");
            tokio::time::sleep(wait).await;

            let ran = when_online(&self.connectivity, "daily report", || async {
                if let Err(e) = self.dispatcher.combined_report(self.operator.as_ref()).await {
                    tracing::error!(error = %e, "Daily report failed");
                }
            })
            .await;
            if !ran {
                tracing::warn!("Daily report skipped while offline");
            }
        }
    }
}

fn minutes(mins: u64) -> Duration {
    Duration::from_secs(mins.max(1) * 60)
}

/// Runs one job cycle unless the network is marked lost. Returns whether it ran.
async fn when_online<F, Fut>(connectivity: &Connectivity, job: &str, run: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    if !connectivity.is_online() {
        tracing::debug!(job, "Offline, skipping");
        return false;
    }
    guarded(job, run()).await;
    true
}

/// A panicking job is logged and the schedule carries on.
async fn guarded<F: Future<Output = ()>>(job: &str, fut: F) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        tracing::error!(job, "Scheduled job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn at(d: u32, h: u32, m: u32) -> DateTime<FixedOffset> {
        kst().with_ymd_and_hms(2026, 3, d, h, m, 0).single().unwrap()
    }

    #[test]
    fn runs_later_today_or_tomorrow() {
        assert_eq!(next_daily_run(at(10, 8, 30), 9, 0), Some(at(10, 9, 0)));
        assert_eq!(next_daily_run(at(10, 9, 0), 9, 0), Some(at(11, 9, 0)));
        assert_eq!(next_daily_run(at(10, 23, 59), 9, 0), Some(at(11, 9, 0)));
    }

    #[test]
    fn utc_input_is_read_as_korean_time() {
        // 23:30 UTC on the 9th is 08:30 KST on the 10th.
        let utc = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 9, 23, 30, 0)
            .single()
            .unwrap();
        assert_eq!(next_daily_run(utc, 9, 0), Some(at(10, 9, 0)));
    }

    #[test]
    fn invalid_time_is_none() {
        assert_eq!(next_daily_run(at(10, 8, 0), 25, 0), None);
    }

    #[tokio::test]
    async fn offline_cycles_are_skipped() {
        let connectivity = Connectivity::default();
        connectivity.mark_lost();
        let reported = AtomicBool::new(false);
        let report = || async { reported.store(true, Ordering::SeqCst) };

        assert!(!when_online(&connectivity, "daily report", report).await);
        assert!(!reported.load(Ordering::SeqCst));

        connectivity.mark_restored();
        assert!(when_online(&connectivity, "daily report", report).await);
        assert!(reported.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_job_is_contained() {
        guarded("test", async {
            panic!("boom");
        })
        .await;
    }
}
