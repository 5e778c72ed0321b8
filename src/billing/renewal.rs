use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{InvoiceFilter, Stores};

use super::currency::CurrencyGraph;
use super::invoices::{InvoiceStateMachine, NewInvoice};
use super::models::{Account, ActionType, Instance, Invoice, InvoiceStatus, Item};
use super::promo::{estimate_price, PromoDiscountResolver};
use super::settings::{fetch_or_default, CurrencyConf, InvoicesConf, SettingsSource};

const DAY_SECS: i64 = 24 * 3600;
const MONTH_SECS: i64 = 30 * DAY_SECS;

/// Whether an instance expiring at `expires_at` is due for a renewal invoice.
///
/// Short periods (up to 15 days) open the window after `percentage` of the
/// period has elapsed; longer periods open it 10 days before expiry.
pub fn is_expiring(
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    period_secs: i64,
    percentage: f64,
) -> bool {
    let lookahead = if period_secs > 15 * DAY_SECS {
        10 * DAY_SECS
    } else {
        (period_secs as f64 * (1.0 - percentage)) as i64
    };
    now >= expires_at - Duration::seconds(lookahead)
}

/// Whether an open renewal invoice already covers `(instance, expires_at)`.
pub fn already_invoiced(invoices: &[Invoice], instance: Uuid, expires_at: DateTime<Utc>) -> bool {
    let key = instance.to_string();
    invoices
        .iter()
        .filter(|invoice| matches!(invoice.status, InvoiceStatus::Draft | InvoiceStatus::Unpaid))
        .filter_map(|invoice| invoice.meta.get("renewals").and_then(Value::as_object))
        .any(|renewals| {
            renewals.get(&key).and_then(Value::as_i64) == Some(expires_at.timestamp())
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    pub accounts: usize,
    pub created: usize,
    pub warnings: usize,
    pub errors: usize,
}

struct Expiring {
    instance: Instance,
    expires_at: DateTime<Utc>,
    period: i64,
}

/// key: billing-renewal -> daily renewal invoice issuance
#[derive(Clone)]
pub struct RenewalInvoiceIssuer {
    stores: Stores,
    currencies: CurrencyGraph,
    promo: PromoDiscountResolver,
    invoices: InvoiceStateMachine,
    settings: Arc<dyn SettingsSource>,
}

impl RenewalInvoiceIssuer {
    pub fn new(
        stores: Stores,
        currencies: CurrencyGraph,
        promo: PromoDiscountResolver,
        invoices: InvoiceStateMachine,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            stores,
            currencies,
            promo,
            invoices,
            settings,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> BillingResult<RenewalSummary> {
        let conf: InvoicesConf = fetch_or_default(self.settings.as_ref()).await;
        let platform: CurrencyConf = fetch_or_default(self.settings.as_ref()).await;
        let mut summary = RenewalSummary::default();

        let percentage = if conf.issue_renewal_invoice_after > 0.0
            && conf.issue_renewal_invoice_after <= 1.0
        {
            conf.issue_renewal_invoice_after
        } else {
            warn!(
                percentage = conf.issue_renewal_invoice_after,
                "invalid renewal percentage, using 0.9"
            );
            summary.warnings += 1;
            0.9
        };

        let mut by_account: HashMap<Uuid, Vec<Instance>> = HashMap::new();
        for service in self.stores.instances.list_services().await? {
            let instances = self.stores.instances.list_instances(service.uuid).await?;
            by_account
                .entry(service.account)
                .or_default()
                .extend(instances.into_iter().filter(|instance| instance.product.is_some()));
        }

        for (account, instances) in by_account {
            summary.accounts += 1;
            match self
                .renew_account(account, instances, percentage, &platform, now, &mut summary)
                .await
            {
                Ok(Some(invoice)) => {
                    summary.created += 1;
                    debug!(%account, invoice = %invoice.uuid, "renewal invoice issued");
                }
                Ok(None) => {}
                Err(err) => {
                    summary.errors += 1;
                    error!(?err, %account, "failed to issue renewal invoice");
                }
            }
        }

        info!(
            accounts = summary.accounts,
            created = summary.created,
            warnings = summary.warnings,
            errors = summary.errors,
            "renewal invoice issuance finished"
        );
        Ok(summary)
    }

    async fn renew_account(
        &self,
        account: Uuid,
        instances: Vec<Instance>,
        percentage: f64,
        platform: &CurrencyConf,
        now: DateTime<Utc>,
        summary: &mut RenewalSummary,
    ) -> BillingResult<Option<Invoice>> {
        let existing = self
            .stores
            .invoices
            .list_invoices(&InvoiceFilter {
                account: Some(account),
                status: None,
            })
            .await?;

        let mut expiring = Vec::new();
        for instance in instances {
            let Some(product) = instance.product() else {
                warn!(instance = %instance.uuid, "product missing from billing plan");
                summary.warnings += 1;
                continue;
            };
            if product.period <= 0 {
                continue;
            }
            let Some(expires_at) = instance.next_payment_date() else {
                warn!(instance = %instance.uuid, "instance has no next payment date");
                summary.warnings += 1;
                continue;
            };
            if !is_expiring(now, expires_at, product.period, percentage) {
                continue;
            }
            if already_invoiced(&existing, instance.uuid, expires_at) {
                continue;
            }
            let period = product.period;
            expiring.push(Expiring {
                instance,
                expires_at,
                period,
            });
        }
        if expiring.is_empty() {
            return Ok(None);
        }

        let owner = self
            .stores
            .accounts
            .get_account(account)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("account {account}")))?;
        self.issue(&owner, expiring, platform, now).await
    }

    async fn issue(
        &self,
        account: &Account,
        expiring: Vec<Expiring>,
        platform: &CurrencyConf,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        let currency = account.currency_or(platform.currency.id);
        let rate = self
            .currencies
            .get_exchange_rate(platform.currency.id, currency)
            .await?
            .rate;
        let title = match self.currencies.get_currency(currency).await? {
            Some(found) => found.title,
            None => platform.currency.title.clone(),
        };

        let mut items = Vec::with_capacity(expiring.len());
        let mut renewals = Map::new();
        let mut no_discount = 0.0;
        let mut deadline = now;
        for entry in &expiring {
            let instance = &entry.instance;
            let price = self.promo.discounted_price(instance, false, now).await? * rate;
            no_discount += estimate_price(instance, false) * rate;
            items.push(Item {
                description: renewal_description(instance, entry.expires_at, entry.period),
                unit: "Pcs".into(),
                price,
                amount: 1.0,
                instance: Some(instance.uuid),
            });
            renewals.insert(instance.uuid.to_string(), json!(entry.expires_at.timestamp()));
            deadline = deadline.max(entry.expires_at);
        }
        if deadline <= now {
            deadline = now + Duration::seconds(MONTH_SECS);
        }

        let total: f64 = items.iter().map(|item| item.price * item.amount).sum();
        if total <= 0.0 {
            warn!(account = %account.uuid, total, "renewal total is not positive, skipping");
            return Ok(None);
        }
        let mut meta = Map::new();
        meta.insert("creator".into(), json!("system"));
        meta.insert(
            "no_discount_price".into(),
            json!(format!("{no_discount:.2} {title}")),
        );
        meta.insert("renewals".into(), Value::Object(renewals));

        let ctx = self.invoices.system_context();
        self.invoices
            .create_invoice(
                &ctx,
                NewInvoice {
                    account: account.uuid,
                    currency: Some(currency),
                    total,
                    status: Some(InvoiceStatus::Unpaid),
                    action: ActionType::InstanceRenewal,
                    items,
                    deadline: Some(deadline),
                    meta,
                },
                now,
            )
            .await
            .map(Some)
    }
}

fn renewal_description(instance: &Instance, expires_at: DateTime<Utc>, period: i64) -> String {
    let prefix = instance
        .billing_plan
        .meta
        .get("prefix")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let title = instance
        .product()
        .map(|product| product.title.as_str())
        .unwrap_or_default();

    let mut until = if period == MONTH_SECS {
        expires_at
            .checked_add_months(Months::new(1))
            .unwrap_or(expires_at + Duration::seconds(period))
    } else {
        expires_at + Duration::seconds(period)
    };
    if until - expires_at > Duration::seconds(DAY_SECS) {
        until -= Duration::days(1);
    }

    format!(
        "{prefix} {title} ({} - {})",
        expires_at.format("%d.%m.%Y"),
        until.format("%d.%m.%Y")
    )
    .trim()
    .to_string()
}
