#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use billing_backend::billing::models::{
    Account, BillingPlan, Instance, Priority, Product, Record, ResourcePrice, Service,
};
use axum::Router;
use billing_backend::app;
use billing_backend::billing::consumer::QueueIngress;
use billing_backend::billing::settings::{SettingsSource, StaticSettings};
use billing_backend::billing::{BillingEngine, Collaborators};
use billing_backend::store::{AccountStore, InstanceStore, LedgerStore, MemoryStore, Stores};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map};
use uuid::Uuid;

pub const NCU: i32 = 0;
pub const DAY: i64 = 24 * 3600;

pub struct Harness {
    pub engine: Arc<BillingEngine>,
    pub store: Arc<MemoryStore>,
    pub settings: Arc<StaticSettings>,
    pub root: Uuid,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Engine on the in-memory store; `tweak` swaps collaborators before wiring.
pub fn harness_with(tweak: impl FnOnce(&mut Collaborators)) -> Harness {
    build(|_, _| {}, tweak)
}

/// Engine whose store handles can be wrapped before wiring.
pub fn harness_on(wrap: impl FnOnce(&mut Stores, Arc<MemoryStore>)) -> Harness {
    build(wrap, |_| {})
}

fn build(
    wrap: impl FnOnce(&mut Stores, Arc<MemoryStore>),
    tweak: impl FnOnce(&mut Collaborators),
) -> Harness {
    let (mut stores, store) = Stores::memory();
    wrap(&mut stores, store.clone());
    let settings = Arc::new(StaticSettings::new());
    let mut collaborators = Collaborators::local(&stores);
    collaborators.settings = settings.clone() as Arc<dyn SettingsSource>;
    tweak(&mut collaborators);
    let root = Uuid::new_v4();
    Harness {
        engine: Arc::new(BillingEngine::new(stores, collaborators, root)),
        store,
        settings,
        root,
    }
}

impl Harness {
    /// Full router with live consumers behind the queue ingress.
    pub fn router(&self) -> Router {
        let (queues, _workers) = QueueIngress::start(&self.engine, 16);
        app(self.engine.clone(), queues)
    }

    pub async fn account(&self, balance: f64, currency: Option<i32>) -> Account {
        let mut account = Account::new("acme");
        account.balance = balance;
        account.currency = currency;
        self.store.upsert_account(&account).await.unwrap();
        account
    }

    pub async fn store_account(&self, account: &Account) {
        self.store.upsert_account(account).await.unwrap();
    }

    pub async fn balance(&self, account: Uuid) -> f64 {
        self.store.get_account(account).await.unwrap().unwrap().balance
    }

    pub async fn service(&self, account: Uuid) -> Service {
        let service = Service {
            uuid: Uuid::new_v4(),
            title: "hosting".into(),
            account,
        };
        self.store.upsert_service(&service).await.unwrap();
        service
    }

    pub async fn instance(&self, service: Uuid, plan: BillingPlan) -> Instance {
        let instance = Instance {
            uuid: Uuid::new_v4(),
            title: "vm-1".into(),
            service,
            billing_plan: plan,
            product: Some("vds-s".into()),
            resources: Map::new(),
            config: Map::new(),
            data: Map::new(),
            driver: "ione".into(),
        };
        self.store.upsert_instance(&instance).await.unwrap();
        instance
    }

    pub async fn record(&self, record: &Record) {
        self.store.insert_record(record).await.unwrap();
    }
}

/// Monthly 10-unit product with a prepaid `ram` resource priced per GB.
pub fn plan() -> BillingPlan {
    let mut products = HashMap::new();
    products.insert(
        "vds-s".to_string(),
        Product {
            title: "VDS S".into(),
            price: 10.0,
            period: 30 * DAY,
            prepaid: true,
        },
    );
    let mut meta = Map::new();
    meta.insert("prefix".into(), json!("VDS"));
    BillingPlan {
        uuid: Uuid::new_v4(),
        title: "vds".into(),
        products,
        resources: vec![ResourcePrice {
            key: "ram".into(),
            price: 2.0,
            period: 30 * DAY,
            prepaid: false,
        }],
        meta,
    }
}

pub fn record(instance: Uuid, total: f64, start: DateTime<Utc>) -> Record {
    Record {
        uuid: Uuid::new_v4(),
        instance,
        resource: "ram".into(),
        product: None,
        start,
        end: start + Duration::hours(1),
        exec: start,
        total,
        currency: None,
        priority: Priority::Normal,
        processed: false,
    }
}
