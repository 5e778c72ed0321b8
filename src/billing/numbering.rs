use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};

use crate::error::BillingResult;
use crate::store::{InvoiceStore, NumberScope};

use super::models::InvoiceStatus;
use super::settings::ResetCounterMode;

/// Fills `{YEAR}`, `{MONTH}`, `{DAY}` and `{NUMBER}` placeholders.
pub fn render_template(template: &str, number: i64, date: DateTime<Utc>) -> String {
    template
        .replace("{YEAR}", &date.year().to_string())
        .replace("{MONTH}", &date.month().to_string())
        .replace("{DAY}", &date.day().to_string())
        .replace("{NUMBER}", &number.to_string())
}

/// Window `[start, end)` within which the paid counter keeps increasing.
pub fn reset_window(
    mode: ResetCounterMode,
    at: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let day = at.date_naive();
    let start = match mode {
        ResetCounterMode::None => return None,
        ResetCounterMode::Daily => day,
        ResetCounterMode::Monthly => NaiveDate::from_ymd_opt(day.year(), day.month(), 1)?,
        ResetCounterMode::Yearly => NaiveDate::from_ymd_opt(day.year(), 1, 1)?,
    };
    let end = match mode {
        ResetCounterMode::None => return None,
        ResetCounterMode::Daily => start.succ_opt()?,
        ResetCounterMode::Monthly => start.checked_add_months(Months::new(1))?,
        ResetCounterMode::Yearly => start.checked_add_months(Months::new(12))?,
    };
    Some((
        Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?),
        Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0)?),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceNumber {
    pub number: String,
    pub numeric: i64,
    pub template: String,
}

/// key: billing-numbering -> next invoice number in a sequence
pub async fn next_number(
    store: &dyn InvoiceStore,
    scope: NumberScope,
    template: &str,
    date: DateTime<Utc>,
) -> BillingResult<InvoiceNumber> {
    let numeric = store.max_numeric_number(scope).await? + 1;
    Ok(InvoiceNumber {
        number: render_template(template, numeric, date),
        numeric,
        template: template.to_string(),
    })
}

/// Sequence used for freshly issued invoices.
pub fn new_invoice_scope() -> NumberScope {
    NumberScope {
        status: InvoiceStatus::Unpaid,
        payment_window: None,
    }
}

/// Sequence used when an invoice is paid at `payment`.
pub fn paid_invoice_scope(mode: ResetCounterMode, payment: DateTime<Utc>) -> NumberScope {
    NumberScope {
        status: InvoiceStatus::Paid,
        payment_window: reset_window(mode, payment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_placeholder() {
        let date = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(
            render_template("{YEAR}/{MONTH}/{DAY}-{NUMBER}", 42, date),
            "2024/3/7-42"
        );
        assert_eq!(render_template("PROFORMA-{NUMBER}", 1, date), "PROFORMA-1");
    }

    #[test]
    fn monthly_window_spans_calendar_month() {
        let at = Utc.with_ymd_and_hms(2024, 12, 15, 8, 30, 0).unwrap();
        let (start, end) = reset_window(ResetCounterMode::Monthly, at).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn daily_and_yearly_windows() {
        let at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
        let (start, end) = reset_window(ResetCounterMode::Daily, at).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());

        let (start, end) = reset_window(ResetCounterMode::Yearly, at).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        assert!(reset_window(ResetCounterMode::None, at).is_none());
    }
}
