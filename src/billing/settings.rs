use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use super::models::{Currency, Rounding};

pub const ROUTINE_KEY: &str = "billing-gen-transactions-routine";
pub const CURRENCY_KEY: &str = "billing-platform-currency";
pub const ROUNDING_KEY: &str = "billing-rounding";
pub const SUSPEND_KEY: &str = "global-suspend-conf";
pub const INVOICES_KEY: &str = "billing-invoices";

/// key: billing-settings -> remote key/value settings source
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
}

/// Settings document with a fallback used whenever the remote value is unusable.
pub trait Setting: DeserializeOwned + Default {
    const KEY: &'static str;
}

/// Reads a typed setting, falling back to its default on any failure.
pub async fn fetch_or_default<T: Setting>(source: &dyn SettingsSource) -> T {
    match source.get(T::KEY).await {
        Ok(Some(value)) => match serde_json::from_value::<T>(value) {
            Ok(conf) => conf,
            Err(err) => {
                warn!(?err, key = T::KEY, "undecodable setting, using default");
                T::default()
            }
        },
        Ok(None) => {
            warn!(key = T::KEY, "setting missing, using default");
            T::default()
        }
        Err(err) => {
            warn!(?err, key = T::KEY, "failed to fetch setting, using default");
            T::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineConf {
    /// Tick frequency in seconds.
    pub freq: u64,
}

impl Default for RoutineConf {
    fn default() -> Self {
        Self { freq: 60 }
    }
}

impl Setting for RoutineConf {
    const KEY: &'static str = ROUTINE_KEY;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrencyConf {
    pub currency: Currency,
}

impl Default for CurrencyConf {
    fn default() -> Self {
        let mut currency = Currency::new(0, "NCU");
        currency.default = true;
        Self { currency }
    }
}

impl Setting for CurrencyConf {
    const KEY: &'static str = CURRENCY_KEY;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundingConf {
    pub rounding: Rounding,
}

impl Default for RoundingConf {
    fn default() -> Self {
        Self {
            rounding: Rounding::Ceil,
        }
    }
}

impl Setting for RoundingConf {
    const KEY: &'static str = ROUNDING_KEY;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub day: u32,
    #[serde(default)]
    pub off: bool,
    #[serde(default)]
    pub from: u32,
    #[serde(default)]
    pub to: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuspendConf {
    #[serde(default)]
    pub auto_resume: bool,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub limit: f64,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    pub is_extra_enabled: bool,
    #[serde(default)]
    pub extra_limit: f64,
}

impl Default for SuspendConf {
    fn default() -> Self {
        let mut schedule = vec![
            ScheduleEntry {
                day: 0,
                off: true,
                from: 0,
                to: 0,
            },
            ScheduleEntry {
                day: 6,
                off: true,
                from: 0,
                to: 0,
            },
        ];
        schedule.extend((1..=5).map(|day| ScheduleEntry {
            day,
            off: false,
            from: 10,
            to: 22,
        }));
        Self {
            auto_resume: true,
            is_enabled: true,
            limit: 10.0,
            schedule,
            is_extra_enabled: false,
            extra_limit: 0.0,
        }
    }
}

impl Setting for SuspendConf {
    const KEY: &'static str = SUSPEND_KEY;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetCounterMode {
    #[default]
    None,
    Daily,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoicesConf {
    pub template: String,
    pub new_template: String,
    #[serde(default)]
    pub reset_counter_mode: ResetCounterMode,
    /// Fraction of the billing period after which a renewal invoice is issued.
    #[serde(default = "default_issue_after")]
    pub issue_renewal_invoice_after: f64,
}

fn default_issue_after() -> f64 {
    0.9
}

impl Default for InvoicesConf {
    fn default() -> Self {
        Self {
            template: "{YEAR}/{MONTH}/{NUMBER}".to_string(),
            new_template: "PROFORMA-{NUMBER}".to_string(),
            reset_counter_mode: ResetCounterMode::None,
            issue_renewal_invoice_after: default_issue_after(),
        }
    }
}

impl Setting for InvoicesConf {
    const KEY: &'static str = INVOICES_KEY;
}

/// key: billing-settings-http -> settings service client
pub struct HttpSettingsClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSettingsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SettingsSource for HttpSettingsClient {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let url = format!("{}/settings/{}", self.base_url, key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach settings service at {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = response
            .error_for_status()?
            .json::<Value>()
            .await
            .context("settings service returned invalid json")?;
        Ok(Some(value))
    }
}

/// In-process settings, used when no settings service is configured.
#[derive(Default)]
pub struct StaticSettings {
    values: RwLock<HashMap<String, Value>>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put<T: Setting + Serialize>(&self, conf: &T) -> Result<()> {
        let value = serde_json::to_value(conf)?;
        self.values.write().await.insert(T::KEY.to_string(), value);
        Ok(())
    }

    pub async fn put_raw(&self, key: &str, value: Value) {
        self.values.write().await.insert(key.to_string(), value);
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }
}
