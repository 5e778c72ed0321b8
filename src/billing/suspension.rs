use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::AccountStore;

use super::adapters::AccountLifecycle;
use super::models::Account;
use super::settings::SuspendConf;

/// Whether the suspend schedule is active at `now` (weekday 0 is Sunday).
pub fn schedule_matches(conf: &SuspendConf, now: DateTime<Utc>) -> bool {
    let day = now.weekday().num_days_from_sunday();
    let hour = now.hour();
    conf.schedule
        .iter()
        .find(|entry| entry.day == day)
        .map(|entry| !entry.off && entry.from <= hour && hour <= entry.to)
        .unwrap_or(false)
}

pub fn should_suspend(account: &Account, conf: &SuspendConf, in_window: bool) -> bool {
    if account.suspended || account.suspend_conf.immune {
        return false;
    }
    let balance = account.balance;
    let local = account.suspend_conf.limit;

    let by_global = in_window
        && conf.is_enabled
        && balance <= conf.limit
        && balance <= local.unwrap_or(0.0);
    let by_local = in_window && local.map_or(false, |limit| balance <= limit);
    let by_extra = conf.is_extra_enabled && balance <= conf.extra_limit;

    by_global || by_local || by_extra
}

pub fn should_unsuspend(account: &Account, conf: &SuspendConf) -> bool {
    if !account.suspended || !conf.auto_resume {
        return false;
    }
    let balance = account.balance;
    match account.suspend_conf.limit {
        Some(local) => balance > local,
        None => balance > conf.limit,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspensionReport {
    pub suspended: Vec<Uuid>,
    pub unsuspended: Vec<Uuid>,
    pub failed: usize,
}

/// key: billing-suspension -> balance threshold suspend/unsuspend policy
#[derive(Clone)]
pub struct SuspensionEngine {
    accounts: Arc<dyn AccountStore>,
    lifecycle: Arc<dyn AccountLifecycle>,
}

impl SuspensionEngine {
    pub fn new(accounts: Arc<dyn AccountStore>, lifecycle: Arc<dyn AccountLifecycle>) -> Self {
        Self {
            accounts,
            lifecycle,
        }
    }

    pub async fn run(
        &self,
        conf: &SuspendConf,
        now: DateTime<Utc>,
    ) -> BillingResult<SuspensionReport> {
        let in_window = schedule_matches(conf, now);
        let accounts = self.accounts.list_accounts().await?;
        let mut report = SuspensionReport::default();

        for account in accounts {
            if should_suspend(&account, conf, in_window) {
                match self.lifecycle.suspend(account.uuid).await {
                    Ok(()) => report.suspended.push(account.uuid),
                    Err(err) => {
                        report.failed += 1;
                        warn!(?err, account = %account.uuid, "failed to suspend account");
                    }
                }
            } else if should_unsuspend(&account, conf) {
                match self.lifecycle.unsuspend(account.uuid).await {
                    Ok(()) => report.unsuspended.push(account.uuid),
                    Err(err) => {
                        report.failed += 1;
                        warn!(?err, account = %account.uuid, "failed to unsuspend account");
                    }
                }
            }
        }

        if !report.suspended.is_empty() || !report.unsuspended.is_empty() {
            info!(
                suspended = report.suspended.len(),
                unsuspended = report.unsuspended.len(),
                failed = report.failed,
                "suspension pass finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::SuspendPolicy;
    use chrono::TimeZone;

    fn account(balance: f64, limit: Option<f64>) -> Account {
        let mut account = Account::new("acme");
        account.balance = balance;
        account.suspend_conf = SuspendPolicy {
            limit,
            immune: false,
        };
        account
    }

    // 2024-03-06 was a Wednesday.
    fn wednesday(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, hour, 0, 0).unwrap()
    }

    #[test]
    fn default_schedule_covers_weekday_business_hours() {
        let conf = SuspendConf::default();
        assert!(schedule_matches(&conf, wednesday(10)));
        assert!(schedule_matches(&conf, wednesday(22)));
        assert!(!schedule_matches(&conf, wednesday(9)));
        assert!(!schedule_matches(&conf, wednesday(23)));
        let sunday = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert!(!schedule_matches(&conf, sunday));
    }

    #[test]
    fn local_limit_suspends_with_global_switched_off() {
        let conf = SuspendConf {
            is_enabled: false,
            ..SuspendConf::default()
        };
        let acc = account(5.0, Some(10.0));
        assert!(should_suspend(&acc, &conf, true));
        assert!(!should_suspend(&acc, &conf, false));
    }

    #[test]
    fn global_rule_treats_missing_local_limit_as_zero() {
        let conf = SuspendConf::default();
        assert!(!should_suspend(&account(5.0, None), &conf, true));
        assert!(should_suspend(&account(-1.0, None), &conf, true));
    }

    #[test]
    fn extra_limit_ignores_schedule() {
        let conf = SuspendConf {
            is_extra_enabled: true,
            extra_limit: -100.0,
            ..SuspendConf::default()
        };
        assert!(should_suspend(&account(-150.0, None), &conf, false));
        assert!(!should_suspend(&account(-50.0, None), &conf, false));
    }

    #[test]
    fn immune_and_already_suspended_accounts_are_skipped() {
        let conf = SuspendConf::default();
        let mut immune = account(-500.0, Some(0.0));
        immune.suspend_conf.immune = true;
        assert!(!should_suspend(&immune, &conf, true));

        let mut suspended = account(-500.0, Some(0.0));
        suspended.suspended = true;
        assert!(!should_suspend(&suspended, &conf, true));
    }

    #[test]
    fn unsuspend_requires_auto_resume_and_recovered_balance() {
        let conf = SuspendConf::default();
        let mut acc = account(11.0, None);
        acc.suspended = true;
        assert!(should_unsuspend(&acc, &conf));

        acc.balance = 9.0;
        assert!(!should_unsuspend(&acc, &conf));

        acc.suspend_conf.limit = Some(5.0);
        assert!(should_unsuspend(&acc, &conf));

        let manual = SuspendConf {
            auto_resume: false,
            ..SuspendConf::default()
        };
        assert!(!should_unsuspend(&acc, &manual));
    }
}
