use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::BillingResult;

use super::ledger::PassSummary;
use super::renewal::RenewalSummary;
use super::service::BillingEngine;
use super::settings::{fetch_or_default, RoutineConf, SuspendConf};
use super::suspension::SuspensionReport;

pub const LEDGER_ROUTINE: &str = "billing-ledger";
pub const DAILY_ROUTINE: &str = "billing-daily-cron";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub generated: PassSummary,
    pub processed: PassSummary,
    pub suspension: SuspensionReport,
}

/// key: billing-scheduler -> ledger and suspension ticker
pub fn spawn(engine: Arc<BillingEngine>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let routine: RoutineConf = fetch_or_default(engine.settings.as_ref()).await;
        let mut ticker = time::interval(TokioDuration::from_secs(routine.freq.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        engine.routines.started(LEDGER_ROUTINE);
        info!(freq = routine.freq, "billing ledger routine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match process_tick(&engine, now).await {
                        Ok(report) => {
                            engine.routines.succeeded(LEDGER_ROUTINE, now);
                            debug!(?report, "billing tick finished");
                        }
                        Err(err) => {
                            engine.routines.failed(LEDGER_ROUTINE, now, err.to_string());
                            warn!(?err, "billing tick failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        engine.routines.stopped(LEDGER_ROUTINE);
        info!("billing ledger routine stopped");
    })
}

/// key: billing-scheduler -> tick handler
pub async fn process_tick(engine: &BillingEngine, now: DateTime<Utc>) -> Result<TickReport> {
    let generated = engine.ledger.generate(now).await?;
    let processed = engine.ledger.process(now).await?;
    let conf: SuspendConf = fetch_or_default(engine.settings.as_ref()).await;
    let suspension = engine.suspension.run(&conf, now).await?;
    Ok(TickReport {
        generated,
        processed,
        suspension,
    })
}

/// Time left until the next occurrence of `at` (UTC wall clock).
pub fn until_next(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + Duration::days(1)
    };
    next - now
}

fn daily_time() -> NaiveTime {
    NaiveTime::parse_from_str(config::BILLING_DAILY_CRON_TIME.as_str(), "%H:%M:%S").unwrap_or_else(
        |err| {
            warn!(
                ?err,
                value = config::BILLING_DAILY_CRON_TIME.as_str(),
                "invalid daily cron time, using 09:00:00"
            );
            NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
        },
    )
}

/// Delay before the first daily run after a (re)start.
///
/// A day whose slot already passed without a recorded run is caught up immediately.
pub fn first_wait(now: DateTime<Utc>, last: Option<DateTime<Utc>>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let ran_today = last.map_or(false, |last| last.date_naive() >= now.date_naive());
    if ran_today {
        today + Duration::days(1) - now
    } else if now < today {
        today - now
    } else {
        Duration::zero()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyReport {
    pub renewal: RenewalSummary,
    pub terminated: usize,
}

/// key: billing-daily-cron -> renewal invoices and stale top-ups once a day
pub fn spawn_daily(
    engine: Arc<BillingEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let at = daily_time();
        engine.routines.started(DAILY_ROUTINE);
        info!(%at, "billing daily cron started");

        loop {
            let now = Utc::now();
            let wait = match engine.stores.routines.last_run(DAILY_ROUTINE).await {
                Ok(last) => first_wait(now, last, at),
                Err(err) => {
                    warn!(?err, "cannot read last daily run, waiting for the next slot");
                    until_next(now, at)
                }
            };
            if wait <= Duration::zero() {
                info!("daily cron has not run today, starting immediately");
            }
            let wait = wait.to_std().unwrap_or(TokioDuration::from_secs(60));
            tokio::select! {
                _ = time::sleep(wait) => run_daily(&engine).await,
                _ = shutdown.changed() => break,
            }
        }

        engine.routines.stopped(DAILY_ROUTINE);
        info!("billing daily cron stopped");
    })
}

pub async fn daily_jobs(
    engine: &BillingEngine,
    now: DateTime<Utc>,
) -> BillingResult<DailyReport> {
    let renewal = engine.renewal.run(now).await?;
    let terminated = engine
        .invoices
        .terminate_expired_balance_invoices(now)
        .await?;
    Ok(DailyReport {
        renewal,
        terminated,
    })
}

/// Runs the daily jobs in their own task so a panic is reported instead of ending the loop.
/// The run is recorded whatever the outcome, so a failing day is not retried in a loop.
pub async fn run_daily(engine: &Arc<BillingEngine>) {
    let now = Utc::now();
    let job_engine = engine.clone();
    let job = tokio::spawn(async move { daily_jobs(&job_engine, now).await });

    match job.await {
        Ok(Ok(report)) => {
            engine.routines.succeeded(DAILY_ROUTINE, now);
            info!(
                created = report.renewal.created,
                errors = report.renewal.errors,
                terminated = report.terminated,
                "daily cron finished"
            );
        }
        Ok(Err(err)) => {
            engine.routines.failed(DAILY_ROUTINE, now, err.to_string());
            warn!(?err, "daily cron failed");
        }
        Err(err) if err.is_panic() => {
            engine.routines.failed(DAILY_ROUTINE, now, "panic in daily cron");
            error!(?err, "daily cron panicked, continuing");
        }
        Err(err) => {
            engine.routines.failed(DAILY_ROUTINE, now, err.to_string());
            warn!(?err, "daily cron task cancelled");
        }
    }

    if let Err(err) = engine.stores.routines.record_run(DAILY_ROUTINE, now).await {
        error!(?err, "failed to record daily cron run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_run_is_later_today_or_tomorrow() {
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap();
        assert_eq!(until_next(morning, at), Duration::hours(1));

        let evening = Utc.with_ymd_and_hms(2024, 4, 1, 21, 0, 0).unwrap();
        assert_eq!(until_next(evening, at), Duration::hours(12));

        let exact = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        assert_eq!(until_next(exact, at), Duration::days(1));
    }

    #[test]
    fn missed_slot_is_caught_up_on_start() {
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let restart = Utc.with_ymd_and_hms(2024, 4, 2, 14, 0, 0).unwrap();
        let yesterday = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 5).unwrap();
        assert_eq!(first_wait(restart, Some(yesterday), at), Duration::zero());
        assert_eq!(first_wait(restart, None, at), Duration::zero());

        let early = Utc.with_ymd_and_hms(2024, 4, 2, 7, 0, 0).unwrap();
        assert_eq!(first_wait(early, Some(yesterday), at), Duration::hours(2));

        let earlier_today = Utc.with_ymd_and_hms(2024, 4, 2, 9, 0, 3).unwrap();
        assert_eq!(first_wait(restart, Some(earlier_today), at), Duration::hours(19));
    }
}
