mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use billing_backend::billing::adapters::{ChannelNotifier, DriverMethod, ServiceDriver};
use billing_backend::billing::models::{
    Account, ActionType, Instance, Invoice, InvoiceStatus, Item, Priority,
};
use billing_backend::billing::settings::{InvoicesConf, ResetCounterMode};
use billing_backend::billing::{CallContext, NewInvoice, TransitionParams};
use billing_backend::error::BillingError;
use billing_backend::store::{
    AccountStore, InstanceStore, InvoiceFilter, InvoiceStore, MemoryStore, NumberScope,
};
use chrono::{Datelike, Duration, TimeZone, Utc};
use common::{harness, harness_on, harness_with, plan};
use serde_json::{json, Map};
use tokio::sync::mpsc;
use uuid::Uuid;

// key: billing-invoice-tests -> lifecycle, numbering and settlement

fn new_invoice(account: Uuid, action: ActionType, total: f64) -> NewInvoice {
    NewInvoice {
        account,
        currency: None,
        total,
        status: Some(InvoiceStatus::Unpaid),
        action,
        items: Vec::new(),
        deadline: None,
        meta: Map::new(),
    }
}

#[tokio::test]
async fn only_root_creates_invoices() {
    let h = harness();
    let account = h.account(0.0, None).await;
    let owner = CallContext::new(account.uuid);

    let result = h
        .engine
        .invoices
        .create_invoice(
            &owner,
            new_invoice(account.uuid, ActionType::NoAction, 5.0),
            Utc::now(),
        )
        .await;
    assert!(matches!(result, Err(BillingError::PermissionDenied)));
}

#[tokio::test]
async fn items_must_sum_to_total() {
    let h = harness();
    let account = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let mut input = new_invoice(account.uuid, ActionType::NoAction, 10.0);
    input.items = vec![
        Item {
            description: "hosting".into(),
            unit: "Pcs".into(),
            price: 4.0,
            amount: 2.0,
            instance: None,
        },
        Item {
            description: "setup".into(),
            unit: "Pcs".into(),
            price: 1.0,
            amount: 1.0,
            instance: None,
        },
    ];

    let result = h
        .engine
        .invoices
        .create_invoice(&root, input.clone(), Utc::now())
        .await;
    assert!(matches!(result, Err(BillingError::InvalidArgument(_))));

    input.total = 9.0;
    let invoice = h
        .engine
        .invoices
        .create_invoice(&root, input, Utc::now())
        .await
        .unwrap();
    assert_eq!(invoice.items_total(), 9.0);
}

#[tokio::test]
async fn new_invoices_use_proforma_sequence() {
    let h = harness();
    let account = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let first = h
        .engine
        .invoices
        .create_invoice(&root, new_invoice(account.uuid, ActionType::NoAction, 1.0), now)
        .await
        .unwrap();
    let second = h
        .engine
        .invoices
        .create_invoice(&root, new_invoice(account.uuid, ActionType::NoAction, 2.0), now)
        .await
        .unwrap();

    assert_eq!(first.number, "PROFORMA-1");
    assert_eq!(second.number, "PROFORMA-2");
    assert_eq!(second.numeric_number, 2);
}

#[tokio::test]
async fn returned_requires_paid_first() {
    let h = harness();
    let account = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let invoice = h
        .engine
        .invoices
        .create_invoice(&root, new_invoice(account.uuid, ActionType::Balance, 50.0), now)
        .await
        .unwrap();
    assert_eq!(invoice.transactions.len(), 1);

    let result = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Returned,
            TransitionParams::default(),
            now,
        )
        .await;
    assert!(matches!(result, Err(BillingError::InvalidArgument(_))));

    let paid = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Paid,
            TransitionParams::default(),
            now,
        )
        .await
        .unwrap();
    assert_eq!(paid.payment, Some(now));
    assert_eq!(paid.number, format!("{}/{}/1", now.year(), now.month()));

    h.engine.ledger.process(now).await.unwrap();
    assert_eq!(h.balance(account.uuid).await, 50.0);

    let returned = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Returned,
            TransitionParams::default(),
            now,
        )
        .await
        .unwrap();
    assert_eq!(returned.returned, Some(now));
    assert_eq!(returned.transactions.len(), 2);
    assert_eq!(h.balance(account.uuid).await, 0.0);

    let transactions = h.store.transactions().await;
    let reversal = transactions
        .iter()
        .find(|tx| tx.uuid == returned.transactions[1])
        .unwrap();
    assert_eq!(reversal.priority, Priority::Urgent);
    assert_eq!(reversal.total, 50.0);
    assert!(reversal.processed);

    let result = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Canceled,
            TransitionParams::default(),
            now,
        )
        .await;
    assert!(matches!(result, Err(BillingError::InvalidArgument(_))));
}

#[tokio::test]
async fn owner_pays_from_balance() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let h = harness_with(|collaborators| {
        collaborators.notifier = Arc::new(ChannelNotifier::new(tx));
    });
    let account = h.account(100.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let invoice = h
        .engine
        .invoices
        .create_invoice(&root, new_invoice(account.uuid, ActionType::NoAction, 30.0), now)
        .await
        .unwrap();

    let stranger = CallContext::new(Uuid::new_v4());
    assert!(matches!(
        h.engine
            .invoices
            .pay_with_balance(&stranger, invoice.uuid, now)
            .await,
        Err(BillingError::PermissionDenied)
    ));

    let owner = CallContext::new(account.uuid);
    let paid = h
        .engine
        .invoices
        .pay_with_balance(&owner, invoice.uuid, now)
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(h.balance(account.uuid).await, 70.0);

    let keys: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.key())
        .collect();
    assert_eq!(keys, vec!["invoice_created", "invoice_paid"]);
    assert!(matches!(
        h.engine.invoices.get_invoice(&owner, invoice.uuid).await,
        Ok(found) if found.status == InvoiceStatus::Paid
    ));
}

#[tokio::test]
async fn insufficient_balance_keeps_invoice_unpaid() {
    let h = harness();
    let account = h.account(10.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();
    let invoice = h
        .engine
        .invoices
        .create_invoice(&root, new_invoice(account.uuid, ActionType::NoAction, 30.0), now)
        .await
        .unwrap();

    let owner = CallContext::new(account.uuid);
    let result = h
        .engine
        .invoices
        .pay_with_balance(&owner, invoice.uuid, now)
        .await;
    assert!(matches!(result, Err(BillingError::FailedPrecondition(_))));

    let stored = h
        .engine
        .invoices
        .get_invoice(&owner, invoice.uuid)
        .await
        .unwrap();
    assert_eq!(stored.status, InvoiceStatus::Unpaid);
    assert_eq!(h.balance(account.uuid).await, 10.0);
}

#[tokio::test]
async fn accounts_only_list_their_own_invoices() {
    let h = harness();
    let first = h.account(0.0, None).await;
    let second = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();
    for account in [first.uuid, second.uuid] {
        h.engine
            .invoices
            .create_invoice(&root, new_invoice(account, ActionType::NoAction, 1.0), now)
            .await
            .unwrap();
    }

    let own = h
        .engine
        .invoices
        .list_invoices(&CallContext::new(first.uuid), InvoiceFilter::default())
        .await
        .unwrap();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].account, first.uuid);

    let foreign = h
        .engine
        .invoices
        .list_invoices(
            &CallContext::new(first.uuid),
            InvoiceFilter {
                account: Some(second.uuid),
                status: None,
            },
        )
        .await;
    assert!(matches!(foreign, Err(BillingError::PermissionDenied)));

    let all = h
        .engine
        .invoices
        .list_invoices(&root, InvoiceFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

/// Invoice store whose next plain replace fails once armed.
struct FlakyInvoices {
    inner: Arc<MemoryStore>,
    fail_replace: AtomicBool,
}

#[async_trait]
impl InvoiceStore for FlakyInvoices {
    async fn insert_invoice(&self, invoice: &Invoice) -> anyhow::Result<()> {
        self.inner.insert_invoice(invoice).await
    }
    async fn get_invoice(&self, uuid: Uuid) -> anyhow::Result<Option<Invoice>> {
        self.inner.get_invoice(uuid).await
    }
    async fn replace_invoice(&self, invoice: &Invoice) -> anyhow::Result<()> {
        if self.fail_replace.swap(false, Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }
        self.inner.replace_invoice(invoice).await
    }
    async fn replace_invoice_if_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> anyhow::Result<bool> {
        self.inner.replace_invoice_if_status(invoice, expected).await
    }
    async fn list_invoices(&self, filter: &InvoiceFilter) -> anyhow::Result<Vec<Invoice>> {
        self.inner.list_invoices(filter).await
    }
    async fn max_numeric_number(&self, scope: NumberScope) -> anyhow::Result<i64> {
        self.inner.max_numeric_number(scope).await
    }
}

#[tokio::test]
async fn failed_write_after_return_is_not_replayed() {
    let mut flaky = None;
    let h = harness_on(|stores, memory| {
        let invoices = Arc::new(FlakyInvoices {
            inner: memory,
            fail_replace: AtomicBool::new(false),
        });
        stores.invoices = invoices.clone();
        flaky = Some(invoices);
    });
    let flaky = flaky.unwrap();
    let account = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let invoice = h
        .engine
        .invoices
        .create_invoice(&root, new_invoice(account.uuid, ActionType::Balance, 50.0), now)
        .await
        .unwrap();
    h.engine
        .invoices
        .update_status(&root, invoice.uuid, InvoiceStatus::Paid, TransitionParams::default(), now)
        .await
        .unwrap();
    h.engine.ledger.process(now).await.unwrap();
    assert_eq!(h.balance(account.uuid).await, 50.0);

    flaky.fail_replace.store(true, Ordering::SeqCst);
    let first = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Returned,
            TransitionParams::default(),
            now,
        )
        .await;
    assert!(matches!(first, Err(BillingError::Store(_))));
    let stored = h.store.get_invoice(invoice.uuid).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Returned);
    assert_eq!(h.balance(account.uuid).await, 0.0);

    let retry = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Returned,
            TransitionParams::default(),
            now,
        )
        .await;
    assert!(matches!(retry, Err(BillingError::InvalidArgument(_))));
    assert_eq!(h.balance(account.uuid).await, 0.0);
}

/// Account store that yields before every read, like a network round-trip.
struct YieldingAccounts {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl AccountStore for YieldingAccounts {
    async fn get_account(&self, uuid: Uuid) -> anyhow::Result<Option<Account>> {
        tokio::task::yield_now().await;
        self.inner.get_account(uuid).await
    }
    async fn list_accounts(&self) -> anyhow::Result<Vec<Account>> {
        self.inner.list_accounts().await
    }
    async fn upsert_account(&self, account: &Account) -> anyhow::Result<()> {
        self.inner.upsert_account(account).await
    }
    async fn adjust_balance(&self, uuid: Uuid, delta: f64) -> anyhow::Result<()> {
        self.inner.adjust_balance(uuid, delta).await
    }
    async fn set_suspended(&self, uuid: Uuid, suspended: bool) -> anyhow::Result<()> {
        self.inner.set_suspended(uuid, suspended).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_balance_payments_cannot_overdraw() {
    let h = harness_on(|stores, memory| {
        stores.accounts = Arc::new(YieldingAccounts { inner: memory });
    });
    let account = h.account(100.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let mut invoices = Vec::new();
    for _ in 0..8 {
        let invoice = h
            .engine
            .invoices
            .create_invoice(&root, new_invoice(account.uuid, ActionType::NoAction, 100.0), now)
            .await
            .unwrap();
        invoices.push(invoice.uuid);
    }

    let mut handles = Vec::new();
    for uuid in invoices {
        let engine = h.engine.clone();
        let owner = CallContext::new(account.uuid);
        handles.push(tokio::spawn(async move {
            engine.invoices.pay_with_balance(&owner, uuid, now).await
        }));
    }
    let mut paid = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => paid += 1,
            Err(err) => assert!(matches!(err, BillingError::FailedPrecondition(_))),
        }
    }
    assert_eq!(paid, 1);
    assert_eq!(h.balance(account.uuid).await, 0.0);
}

#[tokio::test]
async fn creation_rejects_bad_input() {
    let h = harness();
    let account = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let mut late = new_invoice(account.uuid, ActionType::NoAction, 5.0);
    late.deadline = Some(now - Duration::hours(1));
    let mut paid = new_invoice(account.uuid, ActionType::NoAction, 5.0);
    paid.status = Some(InvoiceStatus::Paid);
    let rejected = [
        late,
        paid,
        new_invoice(account.uuid, ActionType::NoAction, 0.0),
        new_invoice(account.uuid, ActionType::NoAction, -5.0),
    ];
    for input in rejected {
        let result = h.engine.invoices.create_invoice(&root, input, now).await;
        assert!(matches!(result, Err(BillingError::InvalidArgument(_))));
    }
    assert!(h
        .store
        .list_invoices(&InvoiceFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[derive(Default)]
struct RecordingDriver {
    calls: Mutex<Vec<(Uuid, DriverMethod)>>,
}

#[async_trait]
impl ServiceDriver for RecordingDriver {
    async fn invoke(&self, instance: &Instance, method: DriverMethod) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push((instance.uuid, method));
        Ok(())
    }
}

fn instance_invoice(account: Uuid, instance: Uuid, action: ActionType) -> NewInvoice {
    let mut input = new_invoice(account, action, 10.0);
    input.items = vec![Item {
        description: "VDS".into(),
        unit: "Pcs".into(),
        price: 10.0,
        amount: 1.0,
        instance: Some(instance),
    }];
    input
}

#[tokio::test]
async fn status_changes_drive_instances() {
    let driver = Arc::new(RecordingDriver::default());
    let recorded = driver.clone();
    let h = harness_with(move |collaborators| collaborators.driver = driver);
    let account = h.account(0.0, None).await;
    let service = h.service(account.uuid).await;
    let instance = h.instance(service.uuid, plan()).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let renewal = h
        .engine
        .invoices
        .create_invoice(
            &root,
            instance_invoice(account.uuid, instance.uuid, ActionType::InstanceRenewal),
            now,
        )
        .await
        .unwrap();
    let start = h
        .engine
        .invoices
        .create_invoice(
            &root,
            instance_invoice(account.uuid, instance.uuid, ActionType::InstanceStart),
            now,
        )
        .await
        .unwrap();

    for (invoice, status) in [
        (renewal.uuid, InvoiceStatus::Paid),
        (renewal.uuid, InvoiceStatus::Returned),
        (start.uuid, InvoiceStatus::Paid),
        (start.uuid, InvoiceStatus::Returned),
    ] {
        h.engine
            .invoices
            .update_status(&root, invoice, status, TransitionParams::default(), now)
            .await
            .unwrap();
    }

    assert_eq!(
        *recorded.calls.lock().unwrap(),
        vec![
            (instance.uuid, DriverMethod::FreeRenew),
            (instance.uuid, DriverMethod::CancelRenew),
            (instance.uuid, DriverMethod::Suspend),
        ]
    );
    let started = h.store.get_instance(instance.uuid).await.unwrap().unwrap();
    assert_eq!(started.config.get("auto_start"), Some(&json!(true)));
}

#[tokio::test]
async fn monthly_paid_counter_restarts_next_month() {
    let h = harness();
    h.settings
        .put(&InvoicesConf {
            reset_counter_mode: ResetCounterMode::Monthly,
            ..InvoicesConf::default()
        })
        .await
        .unwrap();
    let account = h.account(0.0, None).await;
    let root = CallContext::new(h.root);
    let now = Utc::now();

    let payments = [
        Utc.with_ymd_and_hms(2024, 3, 30, 10, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 31, 23, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 30, 0).unwrap(),
    ];
    let mut numbers = Vec::new();
    for payment in payments {
        let invoice = h
            .engine
            .invoices
            .create_invoice(&root, new_invoice(account.uuid, ActionType::NoAction, 1.0), now)
            .await
            .unwrap();
        let paid = h
            .engine
            .invoices
            .update_status(
                &root,
                invoice.uuid,
                InvoiceStatus::Paid,
                TransitionParams {
                    payment_date: Some(payment),
                },
                now,
            )
            .await
            .unwrap();
        numbers.push(paid.number);
    }
    assert_eq!(numbers, vec!["2024/3/1", "2024/3/2", "2024/4/1"]);
}
