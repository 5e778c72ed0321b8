pub mod adapters;
pub mod api;
pub mod consumer;
pub mod currency;
pub mod gate;
pub mod invoices;
pub mod ledger;
pub mod models;
pub mod numbering;
pub mod promo;
pub mod renewal;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod suspension;

pub use currency::CurrencyGraph;
pub use gate::{GateGuard, TransactionGate};
pub use invoices::{CallContext, InvoiceStateMachine, NewInvoice, TransitionParams};
pub use ledger::UsageLedgerPipeline;
pub use promo::PromoDiscountResolver;
pub use renewal::RenewalInvoiceIssuer;
pub use scheduler::{process_tick as run_billing_tick, spawn as spawn_billing_scheduler};
pub use service::{BillingEngine, Collaborators};
pub use suspension::SuspensionEngine;
