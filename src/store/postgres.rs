use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::billing::models::{
    ActionType, Account, BillingPlan, Currency, ExchangeRate, Instance, Invoice, InvoiceStatus,
    Item, Priority, PromoEntry, PromoItem, Promocode, Record, Rounding, Service, SuspendPolicy,
    Transaction,
};

use super::{
    AccountStore, CurrencyStore, InstanceStore, InvoiceFilter, InvoiceStore, LedgerStore,
    NumberScope, PromocodeStore, RoutineStore,
};

/// key: billing-store-postgres -> sqlx backed persistence
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_invoice(
        &self,
        invoice: &Invoice,
        expected: Option<InvoiceStatus>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billing_invoices SET
                currency = $2,
                total = $3,
                status = $4,
                action_type = $5,
                items = $6,
                transactions = $7,
                deadline = $8,
                payment_at = $9,
                processed_at = $10,
                returned_at = $11,
                number = $12,
                numeric_number = $13,
                number_template = $14,
                meta = $15
            WHERE uuid = $1
              AND ($16::text IS NULL OR status = $16)
            "#,
        )
        .bind(invoice.uuid)
        .bind(invoice.currency)
        .bind(invoice.total)
        .bind(invoice.status.as_str())
        .bind(invoice.action.as_str())
        .bind(Json(&invoice.items))
        .bind(&invoice.transactions)
        .bind(invoice.deadline)
        .bind(invoice.payment)
        .bind(invoice.processed)
        .bind(invoice.returned)
        .bind(&invoice.number)
        .bind(invoice.numeric_number)
        .bind(&invoice.number_template)
        .bind(Json(&invoice.meta))
        .bind(expected.map(|status| status.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(FromRow)]
struct CurrencyRow {
    id: i32,
    title: String,
    code: String,
    public: bool,
    precision: i32,
    rounding: String,
    is_default: bool,
}

impl From<CurrencyRow> for Currency {
    fn from(row: CurrencyRow) -> Self {
        Currency {
            id: row.id,
            title: row.title,
            code: row.code,
            public: row.public,
            precision: row.precision,
            rounding: Rounding::from_str(&row.rounding),
            default: row.is_default,
        }
    }
}

#[derive(FromRow)]
struct RateRow {
    from_currency: i32,
    to_currency: i32,
    rate: f64,
    commission: f64,
}

impl From<RateRow> for ExchangeRate {
    fn from(row: RateRow) -> Self {
        ExchangeRate {
            from: row.from_currency,
            to: row.to_currency,
            rate: row.rate,
            commission: row.commission,
        }
    }
}

#[derive(FromRow)]
struct AccountRow {
    uuid: Uuid,
    title: String,
    balance: f64,
    currency: Option<i32>,
    suspended: bool,
    suspend_limit: Option<f64>,
    suspend_immune: bool,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            uuid: row.uuid,
            title: row.title,
            balance: row.balance,
            currency: row.currency,
            suspended: row.suspended,
            suspend_conf: SuspendPolicy {
                limit: row.suspend_limit,
                immune: row.suspend_immune,
            },
        }
    }
}

#[derive(FromRow)]
struct ServiceRow {
    uuid: Uuid,
    title: String,
    account: Uuid,
}

impl From<ServiceRow> for Service {
    fn from(row: ServiceRow) -> Self {
        Service {
            uuid: row.uuid,
            title: row.title,
            account: row.account,
        }
    }
}

#[derive(FromRow)]
struct InstanceRow {
    uuid: Uuid,
    title: String,
    service: Uuid,
    billing_plan: Json<BillingPlan>,
    product: Option<String>,
    resources: Json<Map<String, Value>>,
    config: Json<Map<String, Value>>,
    data: Json<Map<String, Value>>,
    driver: String,
}

impl From<InstanceRow> for Instance {
    fn from(row: InstanceRow) -> Self {
        Instance {
            uuid: row.uuid,
            title: row.title,
            service: row.service,
            billing_plan: row.billing_plan.0,
            product: row.product,
            resources: row.resources.0,
            config: row.config.0,
            data: row.data.0,
            driver: row.driver,
        }
    }
}

#[derive(FromRow)]
struct RecordRow {
    uuid: Uuid,
    instance: Uuid,
    resource: String,
    product: Option<String>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    exec_at: DateTime<Utc>,
    total: f64,
    currency: Option<i32>,
    priority: String,
    processed: bool,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            uuid: row.uuid,
            instance: row.instance,
            resource: row.resource,
            product: row.product,
            start: row.start_at,
            end: row.end_at,
            exec: row.exec_at,
            total: row.total,
            currency: row.currency,
            priority: Priority::from_str(&row.priority),
            processed: row.processed,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    uuid: Uuid,
    account: Uuid,
    service: Option<Uuid>,
    currency: i32,
    total: f64,
    records: Vec<Uuid>,
    exec_at: Option<DateTime<Utc>>,
    processed: bool,
    proc_at: Option<DateTime<Utc>>,
    priority: String,
    created_at: DateTime<Utc>,
    meta: Json<Map<String, Value>>,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Transaction {
            uuid: row.uuid,
            account: row.account,
            service: row.service,
            currency: row.currency,
            total: row.total,
            records: row.records,
            exec: row.exec_at,
            processed: row.processed,
            proc: row.proc_at,
            priority: Priority::from_str(&row.priority),
            created: row.created_at,
            meta: row.meta.0,
        }
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    uuid: Uuid,
    account: Uuid,
    currency: i32,
    total: f64,
    status: String,
    action_type: String,
    items: Json<Vec<Item>>,
    transactions: Vec<Uuid>,
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    payment_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    returned_at: Option<DateTime<Utc>>,
    number: String,
    numeric_number: i64,
    number_template: String,
    meta: Json<Map<String, Value>>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            uuid: row.uuid,
            account: row.account,
            currency: row.currency,
            total: row.total,
            status: InvoiceStatus::from_str(&row.status),
            action: ActionType::from_str(&row.action_type),
            items: row.items.0,
            transactions: row.transactions,
            created: row.created_at,
            deadline: row.deadline,
            payment: row.payment_at,
            processed: row.processed_at,
            returned: row.returned_at,
            number: row.number,
            numeric_number: row.numeric_number,
            number_template: row.number_template,
            meta: row.meta.0,
        }
    }
}

#[derive(FromRow)]
struct PromocodeRow {
    uuid: Uuid,
    code: String,
    items: Json<Vec<PromoItem>>,
    active_time: i64,
    uses: Json<Vec<PromoEntry>>,
}

impl From<PromocodeRow> for Promocode {
    fn from(row: PromocodeRow) -> Self {
        Promocode {
            uuid: row.uuid,
            code: row.code,
            items: row.items.0,
            active_time: row.active_time,
            uses: row.uses.0,
        }
    }
}

const INSTANCE_COLUMNS: &str =
    "uuid, title, service, billing_plan, product, resources, config, data, driver";
const RECORD_COLUMNS: &str =
    "uuid, instance, resource, product, start_at, end_at, exec_at, total, currency, priority, processed";
const TRANSACTION_COLUMNS: &str = "uuid, account, service, currency, total, records, exec_at, processed, proc_at, priority, created_at, meta";
const INVOICE_COLUMNS: &str = "uuid, account, currency, total, status, action_type, items, transactions, created_at, deadline, payment_at, processed_at, returned_at, number, numeric_number, number_template, meta";

#[async_trait]
impl CurrencyStore for PostgresStore {
    async fn list_currencies(&self) -> Result<Vec<Currency>> {
        let rows = sqlx::query_as::<_, CurrencyRow>(
            "SELECT id, title, code, public, precision, rounding, is_default FROM billing_currencies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Currency::from).collect())
    }

    async fn get_currency(&self, id: i32) -> Result<Option<Currency>> {
        let row = sqlx::query_as::<_, CurrencyRow>(
            "SELECT id, title, code, public, precision, rounding, is_default FROM billing_currencies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Currency::from))
    }

    async fn upsert_currency(&self, currency: &Currency) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_currencies (id, title, code, public, precision, rounding, is_default)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                code = EXCLUDED.code,
                public = EXCLUDED.public,
                precision = EXCLUDED.precision,
                rounding = EXCLUDED.rounding,
                is_default = EXCLUDED.is_default
            "#,
        )
        .bind(currency.id)
        .bind(&currency.title)
        .bind(&currency.code)
        .bind(currency.public)
        .bind(currency.precision)
        .bind(currency.rounding.as_str())
        .bind(currency.default)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_rates(&self) -> Result<Vec<ExchangeRate>> {
        let rows = sqlx::query_as::<_, RateRow>(
            "SELECT from_currency, to_currency, rate, commission FROM billing_exchange_rates ORDER BY from_currency, to_currency",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ExchangeRate::from).collect())
    }

    async fn get_rate(&self, from: i32, to: i32) -> Result<Option<ExchangeRate>> {
        let row = sqlx::query_as::<_, RateRow>(
            "SELECT from_currency, to_currency, rate, commission FROM billing_exchange_rates WHERE from_currency = $1 AND to_currency = $2",
        )
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ExchangeRate::from))
    }

    async fn upsert_rate(&self, rate: &ExchangeRate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_exchange_rates (from_currency, to_currency, rate, commission)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (from_currency, to_currency) DO UPDATE SET
                rate = EXCLUDED.rate,
                commission = EXCLUDED.commission
            "#,
        )
        .bind(rate.from)
        .bind(rate.to)
        .bind(rate.rate)
        .bind(rate.commission)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_rate(&self, rate: &ExchangeRate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE billing_exchange_rates SET rate = $3, commission = $4 WHERE from_currency = $1 AND to_currency = $2",
        )
        .bind(rate.from)
        .bind(rate.to)
        .bind(rate.rate)
        .bind(rate.commission)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_rate(&self, from: i32, to: i32) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM billing_exchange_rates WHERE from_currency = $1 AND to_currency = $2",
        )
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AccountStore for PostgresStore {
    async fn get_account(&self, uuid: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT uuid, title, balance, currency, suspended, suspend_limit, suspend_immune FROM billing_accounts WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT uuid, title, balance, currency, suspended, suspend_limit, suspend_immune FROM billing_accounts",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_accounts (uuid, title, balance, currency, suspended, suspend_limit, suspend_immune)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (uuid) DO UPDATE SET
                title = EXCLUDED.title,
                balance = EXCLUDED.balance,
                currency = EXCLUDED.currency,
                suspended = EXCLUDED.suspended,
                suspend_limit = EXCLUDED.suspend_limit,
                suspend_immune = EXCLUDED.suspend_immune
            "#,
        )
        .bind(account.uuid)
        .bind(&account.title)
        .bind(account.balance)
        .bind(account.currency)
        .bind(account.suspended)
        .bind(account.suspend_conf.limit)
        .bind(account.suspend_conf.immune)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn adjust_balance(&self, uuid: Uuid, delta: f64) -> Result<()> {
        let result =
            sqlx::query("UPDATE billing_accounts SET balance = balance + $2 WHERE uuid = $1")
                .bind(uuid)
                .bind(delta)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("account {uuid} not found"));
        }
        Ok(())
    }

    async fn set_suspended(&self, uuid: Uuid, suspended: bool) -> Result<()> {
        let result = sqlx::query("UPDATE billing_accounts SET suspended = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(suspended)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("account {uuid} not found"));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn list_services(&self) -> Result<Vec<Service>> {
        let rows =
            sqlx::query_as::<_, ServiceRow>("SELECT uuid, title, account FROM billing_services")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Service::from).collect())
    }

    async fn get_service(&self, uuid: Uuid) -> Result<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(
            "SELECT uuid, title, account FROM billing_services WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Service::from))
    }

    async fn upsert_service(&self, service: &Service) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_services (uuid, title, account)
            VALUES ($1, $2, $3)
            ON CONFLICT (uuid) DO UPDATE SET title = EXCLUDED.title, account = EXCLUDED.account
            "#,
        )
        .bind(service.uuid)
        .bind(&service.title)
        .bind(service.account)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, uuid: Uuid) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM billing_instances WHERE uuid = $1"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Instance::from))
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_instances (uuid, title, service, billing_plan, product, resources, config, data, driver)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (uuid) DO UPDATE SET
                title = EXCLUDED.title,
                service = EXCLUDED.service,
                billing_plan = EXCLUDED.billing_plan,
                product = EXCLUDED.product,
                resources = EXCLUDED.resources,
                config = EXCLUDED.config,
                data = EXCLUDED.data,
                driver = EXCLUDED.driver
            "#,
        )
        .bind(instance.uuid)
        .bind(&instance.title)
        .bind(instance.service)
        .bind(Json(&instance.billing_plan))
        .bind(&instance.product)
        .bind(Json(&instance.resources))
        .bind(Json(&instance.config))
        .bind(Json(&instance.data))
        .bind(&instance.driver)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_instances(&self, service: Uuid) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM billing_instances WHERE service = $1"
        ))
        .bind(service)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Instance::from).collect())
    }

    async fn set_instance_config(&self, uuid: Uuid, key: &str, value: Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE billing_instances SET config = jsonb_set(config, ARRAY[$2::text], $3, TRUE) WHERE uuid = $1",
        )
        .bind(uuid)
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("instance {uuid} not found"));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn insert_record(&self, record: &Record) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_records (uuid, instance, resource, product, start_at, end_at, exec_at, total, currency, priority, processed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.uuid)
        .bind(record.instance)
        .bind(&record.resource)
        .bind(&record.product)
        .bind(record.start)
        .bind(record.end)
        .bind(record.exec)
        .bind(record.total)
        .bind(record.currency)
        .bind(record.priority.as_str())
        .bind(record.processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn overlapping_records(&self, record: &Record) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM billing_records
            WHERE instance = $1 AND resource = $2 AND start_at < $4 AND $3 < end_at AND uuid <> $5
            "#
        ))
        .bind(record.instance)
        .bind(&record.resource)
        .bind(record.start)
        .bind(record.end)
        .bind(record.uuid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Record::from).collect())
    }

    async fn pending_records(
        &self,
        instances: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM billing_records
            WHERE processed = FALSE AND exec_at <= $2 AND instance = ANY($1)
            ORDER BY exec_at
            "#
        ))
        .bind(instances)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Record::from).collect())
    }

    async fn claim_record(&self, uuid: Uuid, total: f64, currency: i32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE billing_records SET processed = TRUE, total = $2, currency = $3 WHERE uuid = $1 AND processed = FALSE",
        )
        .bind(uuid)
        .bind(total)
        .bind(currency)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_transactions (uuid, account, service, currency, total, records, exec_at, processed, proc_at, priority, created_at, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(transaction.uuid)
        .bind(transaction.account)
        .bind(transaction.service)
        .bind(transaction.currency)
        .bind(transaction.total)
        .bind(&transaction.records)
        .bind(transaction.exec)
        .bind(transaction.processed)
        .bind(transaction.proc)
        .bind(transaction.priority.as_str())
        .bind(transaction.created)
        .bind(Json(&transaction.meta))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transaction(&self, uuid: Uuid) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM billing_transactions WHERE uuid = $1"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Transaction::from))
    }

    async fn due_transactions(
        &self,
        account: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM billing_transactions
            WHERE processed = FALSE AND exec_at IS NOT NULL AND exec_at <= $1
              AND ($2::uuid IS NULL OR account = $2)
            ORDER BY created_at
            "#
        ))
        .bind(now)
        .bind(account)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    async fn schedule_transaction(&self, uuid: Uuid, exec: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE billing_transactions SET exec_at = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(exec)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settle_transaction(
        &self,
        transaction: &Transaction,
        total: f64,
        currency: i32,
        proc: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            r#"
            UPDATE billing_transactions
            SET processed = TRUE, proc_at = $2, total = $3, currency = $4
            WHERE uuid = $1 AND processed = FALSE
            "#,
        )
        .bind(transaction.uuid)
        .bind(proc)
        .bind(total)
        .bind(currency)
        .execute(&mut tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let debited =
            sqlx::query("UPDATE billing_accounts SET balance = balance - $2 WHERE uuid = $1")
                .bind(transaction.account)
                .bind(total)
                .execute(&mut tx)
                .await?;
        if debited.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(anyhow!("account {} not found", transaction.account));
        }
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl InvoiceStore for PostgresStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO billing_invoices ({INVOICE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#
        ))
        .bind(invoice.uuid)
        .bind(invoice.account)
        .bind(invoice.currency)
        .bind(invoice.total)
        .bind(invoice.status.as_str())
        .bind(invoice.action.as_str())
        .bind(Json(&invoice.items))
        .bind(&invoice.transactions)
        .bind(invoice.created)
        .bind(invoice.deadline)
        .bind(invoice.payment)
        .bind(invoice.processed)
        .bind(invoice.returned)
        .bind(&invoice.number)
        .bind(invoice.numeric_number)
        .bind(&invoice.number_template)
        .bind(Json(&invoice.meta))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invoice(&self, uuid: Uuid) -> Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM billing_invoices WHERE uuid = $1"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Invoice::from))
    }

    async fn replace_invoice(&self, invoice: &Invoice) -> Result<()> {
        if self.write_invoice(invoice, None).await? == 0 {
            return Err(anyhow!("invoice {} not found", invoice.uuid));
        }
        Ok(())
    }

    async fn replace_invoice_if_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> Result<bool> {
        Ok(self.write_invoice(invoice, Some(expected)).await? == 1)
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM billing_invoices
            WHERE ($1::uuid IS NULL OR account = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at
            "#
        ))
        .bind(filter.account)
        .bind(filter.status.map(|status| status.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    async fn max_numeric_number(&self, scope: NumberScope) -> Result<i64> {
        let (start, end) = scope.payment_window.unzip();
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(numeric_number) FROM billing_invoices
            WHERE status = $1
              AND ($2::timestamptz IS NULL OR (payment_at >= $2 AND payment_at < $3))
            "#,
        )
        .bind(scope.status.as_str())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }
}

#[async_trait]
impl PromocodeStore for PostgresStore {
    async fn get_promocode(&self, uuid: Uuid) -> Result<Option<Promocode>> {
        let row = sqlx::query_as::<_, PromocodeRow>(
            "SELECT uuid, code, items, active_time, uses FROM billing_promocodes WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Promocode::from))
    }

    async fn upsert_promocode(&self, promocode: &Promocode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_promocodes (uuid, code, items, active_time, uses)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uuid) DO UPDATE SET
                code = EXCLUDED.code,
                items = EXCLUDED.items,
                active_time = EXCLUDED.active_time,
                uses = EXCLUDED.uses
            "#,
        )
        .bind(promocode.uuid)
        .bind(&promocode.code)
        .bind(Json(&promocode.items))
        .bind(promocode.active_time)
        .bind(Json(&promocode.uses))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promocodes_for_instance(&self, instance: Uuid) -> Result<Vec<Promocode>> {
        let rows = sqlx::query_as::<_, PromocodeRow>(
            "SELECT uuid, code, items, active_time, uses FROM billing_promocodes WHERE uses @> $1",
        )
        .bind(Json(json!([{ "instance": instance }])))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Promocode::from).collect())
    }

    async fn add_promocode_use(&self, uuid: Uuid, entry: &PromoEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, PromocodeRow>(
            "SELECT uuid, code, items, active_time, uses FROM billing_promocodes WHERE uuid = $1 FOR UPDATE",
        )
        .bind(uuid)
        .fetch_optional(&mut tx)
        .await?;
        let Some(row) = row else {
            return Err(anyhow!("promocode {uuid} not found"));
        };

        let mut uses = row.uses.0;
        if uses.iter().any(|existing| existing.same_target(entry)) {
            tx.rollback().await?;
            return Ok(false);
        }
        uses.push(entry.clone());
        sqlx::query("UPDATE billing_promocodes SET uses = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(Json(&uses))
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl RoutineStore for PostgresStore {
    async fn last_run(&self, routine: &str) -> Result<Option<DateTime<Utc>>> {
        let last = sqlx::query_scalar(
            "SELECT last_execution FROM billing_routine_runs WHERE routine = $1",
        )
        .bind(routine)
        .fetch_optional(&self.pool)
        .await?;
        Ok(last)
    }

    async fn record_run(&self, routine: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_routine_runs (routine, last_execution)
            VALUES ($1, $2)
            ON CONFLICT (routine) DO UPDATE SET last_execution = EXCLUDED.last_execution
            "#,
        )
        .bind(routine)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
