mod common;

use std::sync::Arc;

use billing_backend::billing::adapters::{
    DriverMethod, HttpDriverClient, HttpPaymentGateway, PaymentGateway, ServiceDriver,
};
use billing_backend::billing::models::{ActionType, InvoiceStatus, Rounding};
use billing_backend::billing::settings::{
    fetch_or_default, HttpSettingsClient, RoundingConf, SuspendConf, ROUNDING_KEY, SUSPEND_KEY,
};
use billing_backend::billing::{CallContext, NewInvoice, TransitionParams};
use chrono::Utc;
use common::{harness, harness_with, plan};
use httpmock::prelude::*;
use serde_json::{json, Map};

// key: billing-http-tests -> settings, gateway and driver clients

#[tokio::test]
async fn settings_client_decodes_and_falls_back() {
    let server = MockServer::start_async().await;
    let rounding = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/settings/{ROUNDING_KEY}"));
            then.status(200).json_body(json!({"rounding": "FLOOR"}));
        })
        .await;
    let suspend = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/settings/{SUSPEND_KEY}"));
            then.status(404);
        })
        .await;

    let client = HttpSettingsClient::new(server.base_url());
    let conf: RoundingConf = fetch_or_default(&client).await;
    assert_eq!(conf.rounding, Rounding::Floor);
    let conf: SuspendConf = fetch_or_default(&client).await;
    assert_eq!(conf, SuspendConf::default());

    rounding.assert_async().await;
    suspend.assert_async().await;
}

#[tokio::test]
async fn unreachable_settings_service_uses_defaults() {
    let client = HttpSettingsClient::new("http://127.0.0.1:9");
    let conf: RoundingConf = fetch_or_default(&client).await;
    assert_eq!(conf, RoundingConf::default());
}

#[tokio::test]
async fn driver_client_posts_method_to_driver_type() {
    let h = harness();
    let account = h.account(0.0, None).await;
    let service = h.service(account.uuid).await;
    let instance = h.instance(service.uuid, plan()).await;

    let server = MockServer::start_async().await;
    let invoke = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/drivers/ione/invoke")
                .json_body(json!({"instance": instance.uuid, "method": "free_renew"}));
            then.status(200);
        })
        .await;

    let driver = HttpDriverClient::new(server.base_url());
    driver
        .invoke(&instance, DriverMethod::FreeRenew)
        .await
        .unwrap();
    invoke.assert_async().await;

    let failing = HttpDriverClient::new(format!("{}/missing", server.base_url()));
    assert!(failing.invoke(&instance, DriverMethod::Suspend).await.is_err());
}

#[tokio::test]
async fn gateway_is_notified_unless_the_call_came_from_it() {
    let server = MockServer::start_async().await;
    let created = server
        .mock_async(|when, then| {
            when.method(POST).path("/invoices");
            then.status(201);
        })
        .await;

    let base_url = server.base_url();
    let h = harness_with(|collaborators| {
        collaborators.gateway =
            Arc::new(HttpPaymentGateway::new(base_url)) as Arc<dyn PaymentGateway>;
    });
    let account = h.account(0.0, None).await;
    let input = NewInvoice {
        account: account.uuid,
        currency: None,
        total: 4.0,
        status: Some(InvoiceStatus::Unpaid),
        action: ActionType::NoAction,
        items: Vec::new(),
        deadline: None,
        meta: Map::new(),
    };
    let now = Utc::now();

    let root = CallContext::new(h.root);
    let invoice = h
        .engine
        .invoices
        .create_invoice(&root, input.clone(), now)
        .await
        .unwrap();
    h.engine
        .invoices
        .create_invoice(&root.from_gateway(true), input, now)
        .await
        .unwrap();
    created.assert_hits_async(1).await;

    // Gateway failures never undo a committed transition.
    let updated = h
        .engine
        .invoices
        .update_status(
            &root,
            invoice.uuid,
            InvoiceStatus::Canceled,
            TransitionParams::default(),
            now,
        )
        .await
        .unwrap();
    assert_eq!(updated.status, InvoiceStatus::Canceled);
}
