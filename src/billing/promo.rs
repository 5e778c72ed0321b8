use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::Stores;

use super::currency::CurrencyGraph;
use super::models::{Instance, PromoTarget, Promocode, Transaction};

const EPSILON: f64 = 1e-9;

/// key: billing-promo -> instance pricing with promocode discounts
#[derive(Clone)]
pub struct PromoDiscountResolver {
    stores: Stores,
    currencies: CurrencyGraph,
}

impl PromoDiscountResolver {
    pub fn new(stores: Stores, currencies: CurrencyGraph) -> Self {
        Self { stores, currencies }
    }

    /// Promocodes bound to the instance whose use window is still open.
    pub async fn active_promocodes(
        &self,
        instance: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Promocode>> {
        let promocodes = self.stores.promocodes.promocodes_for_instance(instance).await?;
        Ok(promocodes
            .into_iter()
            .filter(|promo| match promo.entry_for_instance(instance) {
                Some(entry) => entry.exec + Duration::seconds(promo.active_time) >= now,
                None => false,
            })
            .collect())
    }

    pub async fn discounted_price(
        &self,
        instance: &Instance,
        include_one_time: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<f64> {
        let promos = self.active_promocodes(instance.uuid, now).await?;
        Ok(price_with_promos(instance, &promos, include_one_time))
    }

    /// Builds the parked credit reconciling a pre-committed estimate with the promo price.
    ///
    /// Prices are in `from` (platform) currency; the credit is issued in `to`.
    pub async fn fixing_transaction(
        &self,
        account: Uuid,
        estimate: f64,
        discounted: f64,
        from: i32,
        to: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Transaction>> {
        let diff = estimate - discounted;
        if diff.abs() < EPSILON {
            return Ok(None);
        }
        if diff < 0.0 {
            warn!(
                %account,
                estimate,
                discounted,
                "discounted price exceeds estimate, fixing transaction skipped"
            );
            return Ok(None);
        }
        let credit = self.currencies.convert_rounded(from, to, diff).await?;
        let mut transaction = Transaction::new(account, to, -credit, now);
        transaction
            .meta
            .insert("kind".into(), Value::String("promo_fixing".into()));
        debug!(%account, credit, "promo fixing transaction prepared");
        Ok(Some(transaction))
    }
}

fn resource_number(instance: &Instance, key: &str) -> f64 {
    instance
        .resources
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// One priced component of an instance: `(target, price)`.
fn components<'a>(
    instance: &'a Instance,
    include_one_time: bool,
) -> Vec<(PromoTarget<'a>, f64)> {
    let mut components = Vec::new();
    let plan = &instance.billing_plan;

    if let (Some(key), Some(product)) = (instance.product.as_deref(), instance.product()) {
        if product.period != 0 || include_one_time {
            components.push((PromoTarget::Product(key), product.price));
        }
    }

    let drive_type = instance
        .resources
        .get("drive_type")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    for resource in &plan.resources {
        if resource.period == 0 && !include_one_time {
            continue;
        }
        let price = if resource.key == "ram" {
            resource_number(instance, "ram") / 1024.0 * resource.price
        } else if resource.key.contains("drive") {
            if resource.key != format!("drive_{drive_type}") {
                continue;
            }
            resource_number(instance, "drive_size") / 1024.0 * resource.price
        } else {
            resource_number(instance, &resource.key) * resource.price
        };
        components.push((PromoTarget::Resource(resource.key.as_str()), price));
    }
    components
}

/// Undiscounted price of the instance's product and resources.
///
/// `ram` and `drive_size` are given in MB and priced per GB.
pub fn estimate_price(instance: &Instance, include_one_time: bool) -> f64 {
    components(instance, include_one_time)
        .into_iter()
        .map(|(_, price)| price)
        .sum()
}

/// Largest discount any promo item grants on a single component.
pub fn best_discount(
    promos: &[Promocode],
    plan: Uuid,
    target: &PromoTarget<'_>,
    cost: f64,
) -> f64 {
    promos
        .iter()
        .flat_map(|promo| promo.items.iter())
        .filter(|item| item.applies_to(plan, target))
        .map(|item| item.schema.discount(cost))
        .fold(0.0, f64::max)
}

pub fn price_with_promos(instance: &Instance, promos: &[Promocode], include_one_time: bool) -> f64 {
    let plan = instance.billing_plan.uuid;
    components(instance, include_one_time)
        .into_iter()
        .map(|(target, price)| price - best_discount(promos, plan, &target, price))
        .sum()
}
