use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{InvoiceFilter, Stores};

use super::adapters::{BillingEvent, DriverMethod, EventNotifier, PaymentGateway, ServiceDriver};
use super::currency::CurrencyGraph;
use super::gate::TransactionGate;
use super::ledger::UsageLedgerPipeline;
use super::models::{Account, ActionType, Invoice, InvoiceStatus, Item, Priority, Transaction};
use super::numbering::{new_invoice_scope, next_number, paid_invoice_scope};
use super::settings::{fetch_or_default, CurrencyConf, InvoicesConf, SettingsSource};

const TOTAL_TOLERANCE: f64 = 1e-6;
/// Grace period after creation before an overdue top-up invoice is terminated.
pub const EXPIRED_BALANCE_GRACE_HOURS: i64 = 72;

/// Who is calling and whether the call came back from the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub requestor: Uuid,
    pub from_gateway: bool,
}

impl CallContext {
    pub fn new(requestor: Uuid) -> Self {
        Self {
            requestor,
            from_gateway: false,
        }
    }

    pub fn from_gateway(mut self, from_gateway: bool) -> Self {
        self.from_gateway = from_gateway;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewInvoice {
    pub account: Uuid,
    #[serde(default)]
    pub currency: Option<i32>,
    pub total: f64,
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(rename = "type", default)]
    pub action: ActionType,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionParams {
    /// Payment timestamp recorded on PAID; defaults to the transition time.
    #[serde(default)]
    pub payment_date: Option<DateTime<Utc>>,
}

/// Field changes applied to the invoice before its compensating actions run.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoicePatch {
    pub status: InvoiceStatus,
    pub payment: Option<DateTime<Utc>>,
    pub returned: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompensatingAction {
    /// Sets `exec` on every linked transaction so the ledger applies them.
    ScheduleTransactions,
    AssignPaidNumber { payment: DateTime<Utc> },
    StartInstances(Vec<Uuid>),
    InvokeDriver {
        instances: Vec<Uuid>,
        method: DriverMethod,
    },
    /// Appends an urgent negated copy of every linked transaction.
    ReverseTransactions,
    ProcessAccount,
    MarkProcessed,
}

impl CompensatingAction {
    /// Staged actions only change invoice fields and are written with the status.
    pub fn is_staged(&self) -> bool {
        matches!(
            self,
            CompensatingAction::AssignPaidNumber { .. } | CompensatingAction::MarkProcessed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub patch: InvoicePatch,
    pub actions: Vec<CompensatingAction>,
}

/// Rejects forbidden status pairs and any move out of a terminal status.
pub fn check_transition(old: InvoiceStatus, new: InvoiceStatus) -> BillingResult<()> {
    use InvoiceStatus::*;

    if old == new {
        return Err(BillingError::invalid(format!(
            "invoice is already {}",
            old.as_str()
        )));
    }
    if old.is_terminal() {
        return Err(BillingError::invalid(format!(
            "cannot change status of a {} invoice",
            old.as_str()
        )));
    }
    let forbidden = matches!(
        (old, new),
        (Draft, Returned)
            | (Draft, Paid)
            | (Unpaid, Returned)
            | (Paid, Draft)
            | (Paid, Unpaid)
            | (Paid, Canceled)
    );
    if forbidden {
        return Err(BillingError::invalid(format!(
            "cannot convert from {} to {}",
            old.as_str(),
            new.as_str()
        )));
    }
    Ok(())
}

/// Decides what a status change does without touching any store.
pub fn plan_transition(
    invoice: &Invoice,
    new: InvoiceStatus,
    params: &TransitionParams,
    now: DateTime<Utc>,
) -> BillingResult<TransitionPlan> {
    check_transition(invoice.status, new)?;

    let mut patch = InvoicePatch {
        status: new,
        payment: invoice.payment,
        returned: invoice.returned,
    };
    let mut actions = Vec::new();
    let instances = invoice.instances();

    match new {
        InvoiceStatus::Paid => {
            let payment = params.payment_date.unwrap_or(now);
            patch.payment = Some(payment);
            actions.push(CompensatingAction::ScheduleTransactions);
            actions.push(CompensatingAction::AssignPaidNumber { payment });
            match invoice.action {
                ActionType::InstanceStart => {
                    actions.push(CompensatingAction::StartInstances(instances))
                }
                ActionType::InstanceRenewal => actions.push(CompensatingAction::InvokeDriver {
                    instances,
                    method: DriverMethod::FreeRenew,
                }),
                ActionType::Balance | ActionType::NoAction => {}
            }
            actions.push(CompensatingAction::MarkProcessed);
        }
        InvoiceStatus::Returned => {
            patch.returned = Some(now);
            actions.push(CompensatingAction::ReverseTransactions);
            match invoice.action {
                ActionType::InstanceStart => actions.push(CompensatingAction::InvokeDriver {
                    instances,
                    method: DriverMethod::Suspend,
                }),
                ActionType::InstanceRenewal => actions.push(CompensatingAction::InvokeDriver {
                    instances,
                    method: DriverMethod::CancelRenew,
                }),
                ActionType::Balance | ActionType::NoAction => {}
            }
            actions.push(CompensatingAction::ProcessAccount);
        }
        InvoiceStatus::Draft
        | InvoiceStatus::Unpaid
        | InvoiceStatus::Canceled
        | InvoiceStatus::Terminated => {}
    }

    Ok(TransitionPlan { patch, actions })
}

/// key: billing-invoices -> invoice lifecycle and compensating actions
#[derive(Clone)]
pub struct InvoiceStateMachine {
    stores: Stores,
    currencies: CurrencyGraph,
    ledger: UsageLedgerPipeline,
    gate: TransactionGate,
    settings: Arc<dyn SettingsSource>,
    gateway: Arc<dyn PaymentGateway>,
    driver: Arc<dyn ServiceDriver>,
    notifier: Arc<dyn EventNotifier>,
    root: Uuid,
}

impl InvoiceStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        currencies: CurrencyGraph,
        ledger: UsageLedgerPipeline,
        gate: TransactionGate,
        settings: Arc<dyn SettingsSource>,
        gateway: Arc<dyn PaymentGateway>,
        driver: Arc<dyn ServiceDriver>,
        notifier: Arc<dyn EventNotifier>,
        root: Uuid,
    ) -> Self {
        Self {
            stores,
            currencies,
            ledger,
            gate,
            settings,
            gateway,
            driver,
            notifier,
            root,
        }
    }

    pub fn system_context(&self) -> CallContext {
        CallContext::new(self.root)
    }

    /// A nil root never matches, so a token for the nil uuid gains nothing.
    pub fn is_root(&self, account: Uuid) -> bool {
        !self.root.is_nil() && account == self.root
    }

    fn require_root(&self, ctx: &CallContext) -> BillingResult<()> {
        if self.is_root(ctx.requestor) {
            Ok(())
        } else {
            Err(BillingError::PermissionDenied)
        }
    }

    fn require_owner(&self, ctx: &CallContext, invoice: &Invoice) -> BillingResult<()> {
        if self.is_root(ctx.requestor) || ctx.requestor == invoice.account {
            Ok(())
        } else {
            Err(BillingError::PermissionDenied)
        }
    }

    pub async fn create_invoice(
        &self,
        ctx: &CallContext,
        input: NewInvoice,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        self.require_root(ctx)?;

        let status = input.status.unwrap_or(InvoiceStatus::Draft);
        if !matches!(status, InvoiceStatus::Draft | InvoiceStatus::Unpaid) {
            return Err(BillingError::invalid(format!(
                "invoice cannot be created as {}",
                status.as_str()
            )));
        }
        if !(input.total > 0.0) {
            return Err(BillingError::invalid("invoice total must be positive"));
        }
        if input.account.is_nil() {
            return Err(BillingError::invalid("missing account"));
        }
        if !input.items.is_empty() {
            let sum: f64 = input.items.iter().map(|item| item.price * item.amount).sum();
            if (sum - input.total).abs() > TOTAL_TOLERANCE {
                return Err(BillingError::invalid(format!(
                    "items sum {sum} does not match total {}",
                    input.total
                )));
            }
        }
        if let Some(deadline) = input.deadline {
            if deadline < now {
                return Err(BillingError::invalid("deadline is in the past"));
            }
        }

        let account = self.account(input.account).await?;
        let platform: CurrencyConf = fetch_or_default(self.settings.as_ref()).await;
        let conf: InvoicesConf = fetch_or_default(self.settings.as_ref()).await;
        let currency = input.currency.unwrap_or(platform.currency.id);

        let guard = self.gate.close(account.uuid).await;

        let number = next_number(
            self.stores.invoices.as_ref(),
            new_invoice_scope(),
            &conf.new_template,
            now,
        )
        .await?;

        let mut invoice = Invoice {
            uuid: Uuid::new_v4(),
            account: account.uuid,
            currency,
            total: input.total,
            status,
            action: input.action,
            items: input.items,
            transactions: Vec::new(),
            created: now,
            deadline: input.deadline,
            payment: None,
            processed: None,
            returned: None,
            number: number.number,
            numeric_number: number.numeric,
            number_template: number.template,
            meta: input.meta,
        };

        if invoice.action.is_prepaid() {
            let target = account.currency_or(platform.currency.id);
            let amount = self.currencies.convert(currency, target, invoice.total).await?;
            let mut prepaid = Transaction::new(account.uuid, target, -amount, now);
            prepaid
                .meta
                .insert("invoice".into(), Value::String(invoice.uuid.to_string()));
            self.stores.ledger.insert_transaction(&prepaid).await?;
            invoice.transactions.push(prepaid.uuid);
        }

        self.stores.invoices.insert_invoice(&invoice).await?;
        self.gate.open(guard);

        info!(
            invoice = %invoice.uuid,
            account = %invoice.account,
            number = invoice.number,
            total = invoice.total,
            "invoice created"
        );

        if !ctx.from_gateway {
            if let Err(err) = self.gateway.create_invoice(&invoice).await {
                warn!(?err, invoice = %invoice.uuid, "failed to notify payment gateway");
            }
        }
        self.notifier.publish(BillingEvent::InvoiceCreated {
            invoice: invoice.uuid,
            account: invoice.account,
            total: invoice.total,
        });
        Ok(invoice)
    }

    pub async fn update_status(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        new: InvoiceStatus,
        params: TransitionParams,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        self.require_root(ctx)?;
        self.transition(ctx, uuid, new, params, now).await
    }

    async fn transition(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        new: InvoiceStatus,
        params: TransitionParams,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let account = self.invoice(uuid).await?.account;
        let guard = self.gate.close(account).await;
        let (invoice, previous) = self.transition_locked(uuid, new, params, now).await?;
        self.gate.open(guard);

        self.announce(ctx, &invoice, previous).await;
        Ok(invoice)
    }

    /// Persists the new status before any balance or instance effect runs, so a
    /// failure after the write can never be replayed by a retry. Caller holds the gate.
    async fn transition_locked(
        &self,
        uuid: Uuid,
        new: InvoiceStatus,
        params: TransitionParams,
        now: DateTime<Utc>,
    ) -> BillingResult<(Invoice, InvoiceStatus)> {
        let mut invoice = self.invoice(uuid).await?;
        let previous = invoice.status;
        let plan = plan_transition(&invoice, new, &params, now)?;

        invoice.status = plan.patch.status;
        invoice.payment = plan.patch.payment;
        invoice.returned = plan.patch.returned;

        let (staged, effects): (Vec<_>, Vec<_>) =
            plan.actions.iter().partition(|action| action.is_staged());
        for action in staged {
            self.execute(&mut invoice, action, now).await?;
        }
        let swapped = self
            .stores
            .invoices
            .replace_invoice_if_status(&invoice, previous)
            .await?;
        if !swapped {
            return Err(BillingError::FailedPrecondition(format!(
                "invoice {uuid} is no longer {}",
                previous.as_str()
            )));
        }

        let linked = invoice.transactions.len();
        let mut failure = None;
        for action in effects {
            if let Err(err) = self.execute(&mut invoice, action, now).await {
                error!(
                    ?err,
                    invoice = %uuid,
                    to = invoice.status.as_str(),
                    "compensating action failed after status change"
                );
                failure = Some(err);
                break;
            }
        }
        if invoice.transactions.len() != linked {
            self.stores.invoices.replace_invoice(&invoice).await?;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            invoice = %invoice.uuid,
            from = previous.as_str(),
            to = invoice.status.as_str(),
            "invoice status updated"
        );
        Ok((invoice, previous))
    }

    async fn announce(&self, ctx: &CallContext, invoice: &Invoice, previous: InvoiceStatus) {
        if !ctx.from_gateway {
            if let Err(err) = self.gateway.update_invoice(invoice, previous).await {
                warn!(?err, invoice = %invoice.uuid, "failed to notify payment gateway");
            }
        }
        let event = match invoice.status {
            InvoiceStatus::Paid => Some(BillingEvent::InvoicePaid {
                invoice: invoice.uuid,
                account: invoice.account,
                total: invoice.total,
            }),
            InvoiceStatus::Returned => Some(BillingEvent::InvoiceReturned {
                invoice: invoice.uuid,
                account: invoice.account,
                total: invoice.total,
            }),
            _ => None,
        };
        if let Some(event) = event {
            self.notifier.publish(event);
        }
    }

    async fn execute(
        &self,
        invoice: &mut Invoice,
        action: &CompensatingAction,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        match action {
            CompensatingAction::ScheduleTransactions => {
                for transaction in &invoice.transactions {
                    self.stores
                        .ledger
                        .schedule_transaction(*transaction, now)
                        .await?;
                }
            }
            CompensatingAction::AssignPaidNumber { payment } => {
                let conf: InvoicesConf = fetch_or_default(self.settings.as_ref()).await;
                let number = next_number(
                    self.stores.invoices.as_ref(),
                    paid_invoice_scope(conf.reset_counter_mode, *payment),
                    &conf.template,
                    *payment,
                )
                .await?;
                invoice.number = number.number;
                invoice.numeric_number = number.numeric;
                invoice.number_template = number.template;
            }
            CompensatingAction::StartInstances(instances) => {
                for instance in instances {
                    if let Err(err) = self
                        .stores
                        .instances
                        .set_instance_config(*instance, "auto_start", Value::Bool(true))
                        .await
                    {
                        warn!(?err, %instance, "failed to set auto_start after payment");
                    }
                }
            }
            CompensatingAction::InvokeDriver { instances, method } => {
                for uuid in instances {
                    let instance = match self.stores.instances.get_instance(*uuid).await {
                        Ok(Some(instance)) => instance,
                        Ok(None) => {
                            warn!(instance = %uuid, "invoice item references a missing instance");
                            continue;
                        }
                        Err(err) => {
                            warn!(?err, instance = %uuid, "failed to load instance");
                            continue;
                        }
                    };
                    if let Err(err) = self.driver.invoke(&instance, *method).await {
                        warn!(
                            ?err,
                            instance = %uuid,
                            method = method.as_str(),
                            "driver action failed"
                        );
                    }
                }
            }
            CompensatingAction::ReverseTransactions => {
                let linked = invoice.transactions.clone();
                for uuid in linked {
                    let Some(original) = self.stores.ledger.get_transaction(uuid).await? else {
                        warn!(
                            transaction = %uuid,
                            "linked transaction missing, nothing to reverse"
                        );
                        continue;
                    };
                    let mut reversal =
                        Transaction::new(original.account, original.currency, -original.total, now);
                    reversal.service = original.service;
                    reversal.priority = Priority::Urgent;
                    reversal.exec = Some(now);
                    reversal
                        .meta
                        .insert("reverts".into(), Value::String(original.uuid.to_string()));
                    reversal
                        .meta
                        .insert("invoice".into(), Value::String(invoice.uuid.to_string()));
                    self.stores.ledger.insert_transaction(&reversal).await?;
                    invoice.transactions.push(reversal.uuid);
                }
            }
            CompensatingAction::ProcessAccount => {
                let summary = self.ledger.process_for_account(invoice.account, now).await?;
                debug!(
                    account = %invoice.account,
                    settled = summary.succeeded,
                    "account processed after invoice transition"
                );
            }
            CompensatingAction::MarkProcessed => invoice.processed = Some(now),
        }
        Ok(())
    }

    /// Pays an invoice from the owner's balance. The account stays closed from the
    /// balance check through the debit.
    pub async fn pay_with_balance(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let invoice = self.invoice(uuid).await?;
        self.require_owner(ctx, &invoice)?;
        if invoice.action == ActionType::Balance {
            return Err(BillingError::invalid(
                "balance top-up invoices cannot be paid with balance",
            ));
        }

        let guard = self.gate.close(invoice.account).await;
        let invoice = self.invoice(uuid).await?;
        check_transition(invoice.status, InvoiceStatus::Paid)?;

        let account = self.account(invoice.account).await?;
        let platform: CurrencyConf = fetch_or_default(self.settings.as_ref()).await;
        let account_currency = account.currency_or(platform.currency.id);
        let available = if account_currency == invoice.currency {
            account.balance
        } else {
            self.currencies
                .convert(account_currency, invoice.currency, account.balance)
                .await?
        };
        if available < invoice.total {
            return Err(BillingError::FailedPrecondition(format!(
                "insufficient balance: {available:.2} < {:.2}",
                invoice.total
            )));
        }

        let (mut paid, previous) = self
            .transition_locked(uuid, InvoiceStatus::Paid, TransitionParams::default(), now)
            .await?;

        let mut debit = Transaction::new(account.uuid, paid.currency, paid.total, now);
        debit.priority = Priority::Urgent;
        debit.exec = Some(now);
        debit
            .meta
            .insert("invoice".into(), Value::String(paid.uuid.to_string()));
        self.stores.ledger.insert_transaction(&debit).await?;
        paid.transactions.push(debit.uuid);
        self.stores.invoices.replace_invoice(&paid).await?;
        self.ledger.process_for_account(account.uuid, now).await?;
        self.gate.open(guard);

        info!(invoice = %paid.uuid, account = %account.uuid, "invoice paid with balance");
        self.announce(ctx, &paid, previous).await;
        Ok(paid)
    }

    pub async fn get_invoice(&self, ctx: &CallContext, uuid: Uuid) -> BillingResult<Invoice> {
        let invoice = self.invoice(uuid).await?;
        self.require_owner(ctx, &invoice)?;
        Ok(invoice)
    }

    /// Non-root callers only ever see their own invoices.
    pub async fn list_invoices(
        &self,
        ctx: &CallContext,
        mut filter: InvoiceFilter,
    ) -> BillingResult<Vec<Invoice>> {
        if !self.is_root(ctx.requestor) {
            match filter.account {
                Some(account) if account != ctx.requestor => {
                    return Err(BillingError::PermissionDenied)
                }
                _ => filter.account = Some(ctx.requestor),
            }
        }
        Ok(self.stores.invoices.list_invoices(&filter).await?)
    }

    /// Terminates UNPAID top-up invoices past their deadline and the creation grace period.
    pub async fn terminate_expired_balance_invoices(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<usize> {
        let unpaid = self
            .stores
            .invoices
            .list_invoices(&InvoiceFilter {
                account: None,
                status: Some(InvoiceStatus::Unpaid),
            })
            .await?;
        let ctx = self.system_context();
        let mut terminated = 0;
        for invoice in unpaid {
            if invoice.action != ActionType::Balance {
                continue;
            }
            if invoice.deadline.map_or(false, |deadline| deadline > now) {
                continue;
            }
            if now - invoice.created < Duration::hours(EXPIRED_BALANCE_GRACE_HOURS) {
                continue;
            }
            match self
                .transition(
                    &ctx,
                    invoice.uuid,
                    InvoiceStatus::Terminated,
                    TransitionParams::default(),
                    now,
                )
                .await
            {
                Ok(_) => terminated += 1,
                Err(err) => warn!(
                    ?err,
                    invoice = %invoice.uuid,
                    "failed to terminate expired balance invoice"
                ),
            }
        }
        info!(terminated, "expired balance invoices terminated");
        Ok(terminated)
    }

    /// Links a transaction to an invoice, e.g. a promo fixing credit.
    pub async fn attach_transaction(
        &self,
        invoice: Uuid,
        transaction: &Transaction,
    ) -> BillingResult<Invoice> {
        let guard = self.gate.close(transaction.account).await;
        let mut stored = self.invoice(invoice).await?;
        let mut transaction = transaction.clone();
        transaction
            .meta
            .insert("invoice".into(), Value::String(stored.uuid.to_string()));
        self.stores.ledger.insert_transaction(&transaction).await?;
        stored.transactions.push(transaction.uuid);
        self.stores.invoices.replace_invoice(&stored).await?;
        self.gate.open(guard);
        Ok(stored)
    }

    async fn invoice(&self, uuid: Uuid) -> BillingResult<Invoice> {
        self.stores
            .invoices
            .get_invoice(uuid)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("invoice {uuid}")))
    }

    async fn account(&self, uuid: Uuid) -> BillingResult<Account> {
        self.stores
            .accounts
            .get_account(uuid)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("account {uuid}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(status: InvoiceStatus, action: ActionType) -> Invoice {
        let instance = Uuid::new_v4();
        Invoice {
            uuid: Uuid::new_v4(),
            account: Uuid::new_v4(),
            currency: 0,
            total: 10.0,
            status,
            action,
            items: vec![Item {
                description: "VPS".into(),
                unit: "Pcs".into(),
                price: 10.0,
                amount: 1.0,
                instance: Some(instance),
            }],
            transactions: vec![Uuid::new_v4()],
            created: Utc::now(),
            deadline: None,
            payment: None,
            processed: None,
            returned: None,
            number: "PROFORMA-1".into(),
            numeric_number: 1,
            number_template: "PROFORMA-{NUMBER}".into(),
            meta: Map::new(),
        }
    }

    #[test]
    fn forbidden_pairs_are_rejected() {
        use InvoiceStatus::*;
        for (old, new) in [
            (Draft, Returned),
            (Draft, Paid),
            (Unpaid, Returned),
            (Paid, Draft),
            (Paid, Unpaid),
            (Paid, Canceled),
        ] {
            assert!(check_transition(old, new).is_err(), "{old:?} -> {new:?}");
        }
        for terminal in [Canceled, Returned, Terminated] {
            for target in [Draft, Unpaid, Paid, Canceled, Returned, Terminated] {
                assert!(check_transition(terminal, target).is_err());
            }
        }
        assert!(check_transition(Unpaid, Unpaid).is_err());
        assert!(check_transition(Draft, Unpaid).is_ok());
        assert!(check_transition(Unpaid, Paid).is_ok());
        assert!(check_transition(Paid, Returned).is_ok());
        assert!(check_transition(Unpaid, Canceled).is_ok());
        assert!(check_transition(Paid, Terminated).is_ok());
    }

    #[test]
    fn paid_start_invoice_plans_auto_start() {
        let now = Utc::now();
        let unpaid = invoice(InvoiceStatus::Unpaid, ActionType::InstanceStart);
        let plan =
            plan_transition(&unpaid, InvoiceStatus::Paid, &TransitionParams::default(), now)
                .unwrap();
        assert_eq!(plan.patch.payment, Some(now));
        assert_eq!(
            plan.actions,
            vec![
                CompensatingAction::ScheduleTransactions,
                CompensatingAction::AssignPaidNumber { payment: now },
                CompensatingAction::StartInstances(unpaid.instances()),
                CompensatingAction::MarkProcessed,
            ]
        );
    }

    #[test]
    fn returned_renewal_cancels_renew_and_reverses() {
        let now = Utc::now();
        let paid = invoice(InvoiceStatus::Paid, ActionType::InstanceRenewal);
        let plan =
            plan_transition(&paid, InvoiceStatus::Returned, &TransitionParams::default(), now)
                .unwrap();
        assert_eq!(plan.patch.returned, Some(now));
        assert_eq!(
            plan.actions,
            vec![
                CompensatingAction::ReverseTransactions,
                CompensatingAction::InvokeDriver {
                    instances: paid.instances(),
                    method: DriverMethod::CancelRenew,
                },
                CompensatingAction::ProcessAccount,
            ]
        );
    }

    #[test]
    fn caller_supplied_payment_date_is_kept() {
        let now = Utc::now();
        let paid_at = now - chrono::Duration::days(2);
        let unpaid = invoice(InvoiceStatus::Unpaid, ActionType::NoAction);
        let plan = plan_transition(
            &unpaid,
            InvoiceStatus::Paid,
            &TransitionParams {
                payment_date: Some(paid_at),
            },
            now,
        )
        .unwrap();
        assert_eq!(plan.patch.payment, Some(paid_at));
    }
}
