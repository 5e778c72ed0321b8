use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// key: billing-models -> currencies, ledger, invoices, promocodes

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rounding {
    #[default]
    Round,
    Floor,
    Ceil,
}

impl Rounding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rounding::Round => "ROUND",
            Rounding::Floor => "FLOOR",
            Rounding::Ceil => "CEIL",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CEIL" => Rounding::Ceil,
            "FLOOR" => Rounding::Floor,
            _ => Rounding::Round,
        }
    }

    /// Rounds `amount` to `precision` decimal places.
    pub fn apply(&self, amount: f64, precision: i32) -> f64 {
        let factor = 10f64.powi(precision.max(0));
        // Strip float noise so that e.g. 2.0000000001 does not ceil to 2.01.
        let scaled = (amount * factor * 1e6).round() / 1e6;
        let rounded = match self {
            Rounding::Round => scaled.round(),
            Rounding::Floor => scaled.floor(),
            Rounding::Ceil => scaled.ceil(),
        };
        rounded / factor
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Currency {
    pub id: i32,
    pub title: String,
    #[serde(default)]
    pub code: String,
    #[serde(default = "default_true")]
    pub public: bool,
    #[serde(default = "default_precision")]
    pub precision: i32,
    #[serde(default)]
    pub rounding: Rounding,
    #[serde(default)]
    pub default: bool,
}

impl Currency {
    pub fn new(id: i32, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id,
            code: title.clone(),
            title,
            public: true,
            precision: default_precision(),
            rounding: Rounding::Round,
            default: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_precision() -> i32 {
    2
}

/// Directed exchange edge keyed by the ordered `(from, to)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeRate {
    pub from: i32,
    pub to: i32,
    pub rate: f64,
    #[serde(default)]
    pub commission: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ExchangeQuote {
    pub rate: f64,
    pub commission: f64,
}

impl ExchangeQuote {
    pub const IDENTITY: ExchangeQuote = ExchangeQuote {
        rate: 1.0,
        commission: 0.0,
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuspendPolicy {
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub immune: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub uuid: Uuid,
    pub title: String,
    pub balance: f64,
    #[serde(default)]
    pub currency: Option<i32>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub suspend_conf: SuspendPolicy,
}

impl Account {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            title: title.into(),
            balance: 0.0,
            currency: None,
            suspended: false,
            suspend_conf: SuspendPolicy::default(),
        }
    }

    pub fn currency_or(&self, default: i32) -> i32 {
        self.currency.unwrap_or(default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub uuid: Uuid,
    pub title: String,
    pub account: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub title: String,
    pub price: f64,
    /// Billing period in seconds, `0` for one-time payments.
    #[serde(default)]
    pub period: i64,
    #[serde(default)]
    pub prepaid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourcePrice {
    pub key: String,
    pub price: f64,
    #[serde(default)]
    pub period: i64,
    #[serde(default)]
    pub prepaid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BillingPlan {
    pub uuid: Uuid,
    pub title: String,
    #[serde(default)]
    pub products: HashMap<String, Product>,
    #[serde(default)]
    pub resources: Vec<ResourcePrice>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub uuid: Uuid,
    pub title: String,
    pub service: Uuid,
    pub billing_plan: BillingPlan,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub resources: Map<String, Value>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Service-provider driver type handling this instance.
    #[serde(default)]
    pub driver: String,
}

impl Instance {
    pub fn product(&self) -> Option<&Product> {
        self.product
            .as_ref()
            .and_then(|key| self.billing_plan.products.get(key))
    }

    /// Expiration timestamp the driver reported through `data.next_payment_date`.
    pub fn next_payment_date(&self) -> Option<DateTime<Utc>> {
        self.data
            .get("next_payment_date")
            .and_then(Value::as_f64)
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
    Additional,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "NORMAL",
            Priority::Urgent => "URGENT",
            Priority::Additional => "ADDITIONAL",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "URGENT" => Priority::Urgent,
            "ADDITIONAL" => Priority::Additional,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub uuid: Uuid,
    pub instance: Uuid,
    pub resource: String,
    #[serde(default)]
    pub product: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exec: DateTime<Utc>,
    pub total: f64,
    #[serde(default)]
    pub currency: Option<i32>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub processed: bool,
}

impl Record {
    pub fn overlaps(&self, other: &Record) -> bool {
        self.instance == other.instance
            && self.resource == other.resource
            && self.start < other.end
            && other.start < self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub uuid: Uuid,
    pub account: Uuid,
    #[serde(default)]
    pub service: Option<Uuid>,
    pub currency: i32,
    pub total: f64,
    #[serde(default)]
    pub records: Vec<Uuid>,
    /// Unset while parked behind an unpaid invoice.
    #[serde(default)]
    pub exec: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub proc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Priority,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Transaction {
    pub fn new(account: Uuid, currency: i32, total: f64, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            account,
            service: None,
            currency,
            total,
            records: Vec::new(),
            exec: None,
            processed: false,
            proc: None,
            priority: Priority::Normal,
            created: now,
            meta: Map::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.exec.map(|exec| exec <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Unpaid,
    Paid,
    Canceled,
    Returned,
    Terminated,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Unpaid => "UNPAID",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Canceled => "CANCELED",
            InvoiceStatus::Returned => "RETURNED",
            InvoiceStatus::Terminated => "TERMINATED",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "UNPAID" => InvoiceStatus::Unpaid,
            "PAID" => InvoiceStatus::Paid,
            "CANCELED" => InvoiceStatus::Canceled,
            "RETURNED" => InvoiceStatus::Returned,
            "TERMINATED" => InvoiceStatus::Terminated,
            _ => InvoiceStatus::Draft,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Canceled | InvoiceStatus::Returned | InvoiceStatus::Terminated
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    #[default]
    NoAction,
    Balance,
    InstanceStart,
    InstanceRenewal,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::NoAction => "NO_ACTION",
            ActionType::Balance => "BALANCE",
            ActionType::InstanceStart => "INSTANCE_START",
            ActionType::InstanceRenewal => "INSTANCE_RENEWAL",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "BALANCE" => ActionType::Balance,
            "INSTANCE_START" => ActionType::InstanceStart,
            "INSTANCE_RENEWAL" => ActionType::InstanceRenewal,
            _ => ActionType::NoAction,
        }
    }

    /// Whether creation parks a pre-paid transaction behind the invoice.
    pub fn is_prepaid(&self) -> bool {
        matches!(self, ActionType::Balance | ActionType::InstanceStart)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub description: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub price: f64,
    #[serde(default = "default_amount")]
    pub amount: f64,
    #[serde(default)]
    pub instance: Option<Uuid>,
}

fn default_unit() -> String {
    "Pcs".to_string()
}

fn default_amount() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    pub uuid: Uuid,
    pub account: Uuid,
    pub currency: i32,
    pub total: f64,
    pub status: InvoiceStatus,
    #[serde(rename = "type")]
    pub action: ActionType,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub transactions: Vec<Uuid>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub returned: Option<DateTime<Utc>>,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub numeric_number: i64,
    #[serde(default)]
    pub number_template: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Invoice {
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(|item| item.price * item.amount).sum()
    }

    pub fn instances(&self) -> Vec<Uuid> {
        self.items.iter().filter_map(|item| item.instance).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DiscountSchema {
    /// Fraction of the price taken off, `0.0..=1.0`.
    Percent(f64),
    Amount(f64),
    FixedPrice(f64),
}

impl DiscountSchema {
    pub fn discount(&self, cost: f64) -> f64 {
        let discount = match *self {
            DiscountSchema::Percent(percent) => cost * percent.clamp(0.0, 1.0),
            DiscountSchema::Amount(amount) => amount.min(cost),
            DiscountSchema::FixedPrice(price) => cost - price,
        };
        discount.max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromoItem {
    pub billing_plan: Uuid,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    pub schema: DiscountSchema,
}

impl PromoItem {
    pub fn applies_to(&self, plan: Uuid, target: &PromoTarget<'_>) -> bool {
        if self.billing_plan != plan {
            return false;
        }
        if self.product.is_none() && self.resource.is_none() {
            return true;
        }
        match target {
            PromoTarget::Product(key) => self.product.as_deref() == Some(*key),
            PromoTarget::Resource(key) => self.resource.as_deref() == Some(*key),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PromoTarget<'a> {
    Product(&'a str),
    Resource(&'a str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromoEntry {
    #[serde(default)]
    pub invoice: Option<Uuid>,
    #[serde(default)]
    pub instance: Option<Uuid>,
    pub exec: DateTime<Utc>,
}

impl PromoEntry {
    pub fn for_instance(instance: Uuid, exec: DateTime<Utc>) -> Self {
        Self {
            invoice: None,
            instance: Some(instance),
            exec,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invoice.is_some() != self.instance.is_some()
    }

    pub fn same_target(&self, other: &PromoEntry) -> bool {
        self.invoice == other.invoice && self.instance == other.instance
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Promocode {
    pub uuid: Uuid,
    pub code: String,
    #[serde(default)]
    pub items: Vec<PromoItem>,
    /// How long a use stays active, in seconds.
    pub active_time: i64,
    #[serde(default)]
    pub uses: Vec<PromoEntry>,
}

impl Promocode {
    pub fn entry_for_instance(&self, instance: Uuid) -> Option<&PromoEntry> {
        self.uses
            .iter()
            .find(|entry| entry.instance == Some(instance))
    }
}
