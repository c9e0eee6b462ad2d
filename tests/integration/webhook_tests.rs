//! Billing webhook tests
//!
//! Events are POSTed through the router, then the queued handler tasks are
//! drained.

use chrono::Utc;
use serde_json::json;

use orgledger::api::SIGNATURE_HEADER;
use orgledger::db::{ChargeRepository, CustomerRepository, InvoiceRepository, OrganizationRepository, SubscriptionRepository};
use orgledger::models::{InvoiceStatus, Organization, User};
use orgledger::services::billing_gateway::sign_webhook_payload;
use orgledger::services::{EmailTemplate, RequestContext, SubscriptionUpdate};

use crate::common::{charge, event, invoice, org, plan, set_customer_id, test_config, user, TestApp};

const SECRET: &str = "whsec_test";

async fn signed_app() -> TestApp {
    let mut config = test_config();
    config.billing.webhook_secrets = vec!["whsec_old".to_string(), SECRET.to_string()];
    TestApp::with_config(config).await
}

async fn customer_org(app: &TestApp, customer_id: &str) -> (User, Organization) {
    let admin = user()
        .with_email(&format!("admin-{}@planet.example", customer_id))
        .create(app)
        .await;
    let newsroom = org().create(app, &admin).await;
    set_customer_id(app, newsroom.id, customer_id).await;
    (admin, newsroom)
}

/// A paid subscription started through the engine; returns the provider customer id
async fn subscribed_org(app: &TestApp) -> (User, Organization, String) {
    let admin = user().create(app).await;
    let newsroom = org().create(app, &admin).await;
    let paid = plan().create(app).await;
    let mut ctx = RequestContext::begin();
    app.services
        .billing()
        .set_subscription(
            &mut ctx,
            newsroom.id,
            SubscriptionUpdate {
                plan_id: Some(paid.id),
                max_users: 5,
                token: Some("tok_visa".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    ctx.teardown();

    let mut conn = app.conn().await;
    let customer_id = CustomerRepository::new(&mut conn)
        .get(newsroom.id)
        .await
        .unwrap()
        .and_then(|c| c.customer_id)
        .unwrap();
    (admin, newsroom, customer_id)
}

async fn deliver(app: &TestApp, payload: Vec<u8>) {
    app.post_raw("/webhooks/billing", payload, &[]).await.assert_ok();
    app.run_tasks().await;
}

#[tokio::test]
async fn test_unsigned_payload_accepted_without_secrets() {
    let app = TestApp::new().await;
    let (_admin, newsroom) = customer_org(&app, "cus_unsigned").await;

    deliver(&app, event("invoice.created", invoice("in_unsigned", "cus_unsigned").build())).await;

    let mut conn = app.conn().await;
    let stored = InvoiceRepository::new(&mut conn)
        .get_by_invoice_id("in_unsigned")
        .await
        .unwrap()
        .expect("invoice recorded");
    assert_eq!(stored.organization_id, newsroom.id);
    assert_eq!(stored.subscription_id, None);
}

#[tokio::test]
async fn test_signature_required_when_secrets_configured() {
    let app = signed_app().await;
    let payload = event("invoice.voided", invoice("in_sig", "cus_sig").build());

    app.post_raw("/webhooks/billing", payload.clone(), &[])
        .await
        .assert_bad_request();

    let forged = sign_webhook_payload(&payload, "whsec_wrong", Utc::now().timestamp());
    app.post_raw("/webhooks/billing", payload.clone(), &[(SIGNATURE_HEADER, &forged)])
        .await
        .assert_bad_request();

    let stale = sign_webhook_payload(&payload, SECRET, Utc::now().timestamp() - 3600);
    app.post_raw("/webhooks/billing", payload.clone(), &[(SIGNATURE_HEADER, &stale)])
        .await
        .assert_bad_request();

    let valid = sign_webhook_payload(&payload, SECRET, Utc::now().timestamp());
    app.post_raw("/webhooks/billing", payload, &[(SIGNATURE_HEADER, &valid)])
        .await
        .assert_ok();
    assert_eq!(app.run_tasks().await, 1);
}

#[tokio::test]
async fn test_malformed_payloads_are_rejected() {
    let app = TestApp::new().await;

    app.post_raw("/webhooks/billing", b"{not json".to_vec(), &[])
        .await
        .assert_bad_request();
    app.post_raw(
        "/webhooks/billing",
        json!({"data": {"object": {"id": "in_1"}}}).to_string().into_bytes(),
        &[],
    )
    .await
    .assert_bad_request();
    assert_eq!(app.run_tasks().await, 0);
}

#[tokio::test]
async fn test_unhandled_event_type_is_acknowledged() {
    let app = TestApp::new().await;

    app.post_raw("/webhooks/billing", event("customer.updated", json!({"id": "cus_1"})), &[])
        .await
        .assert_ok();
    assert_eq!(app.run_tasks().await, 0);
}

#[tokio::test]
async fn test_redelivered_charge_is_recorded_once() {
    let app = TestApp::new().await;
    let (admin, newsroom) = customer_org(&app, "cus_charge").await;
    let payload = event("charge.succeeded", charge("ch_once", Some("cus_charge"), 10500));

    deliver(&app, payload.clone()).await;
    deliver(&app, payload).await;

    let mut conn = app.conn().await;
    let charges = ChargeRepository::new(&mut conn)
        .list_for_organization(newsroom.id)
        .await
        .unwrap();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].fee_amount, 5);

    let receipts: Vec<_> = app
        .mailer
        .sent_to(admin.email.as_deref().unwrap())
        .into_iter()
        .filter(|s| s.email.template == EmailTemplate::Receipt)
        .collect();
    assert_eq!(receipts.len(), 1);
}

#[tokio::test]
async fn test_donation_and_anonymous_charges_are_skipped() {
    let app = TestApp::new().await;
    let (_admin, newsroom) = customer_org(&app, "cus_donor").await;

    let mut donation = charge("ch_donation", Some("cus_donor"), 2500);
    donation["metadata"]["action"] = json!("donation");
    deliver(&app, event("charge.succeeded", donation)).await;
    deliver(&app, event("charge.succeeded", charge("ch_anon", None, 2500))).await;

    let mut conn = app.conn().await;
    assert!(ChargeRepository::new(&mut conn)
        .list_for_organization(newsroom.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_subscription_invoice_is_linked() {
    let app = TestApp::new().await;
    let (_admin, newsroom, customer_id) = subscribed_org(&app).await;
    let external = {
        let mut conn = app.conn().await;
        SubscriptionRepository::new(&mut conn)
            .current_for_organization(newsroom.id)
            .await
            .unwrap()
            .and_then(|s| s.subscription_id.map(|external| (s.id, external)))
            .unwrap()
    };

    let created = invoice("in_renewal", &customer_id)
        .subscription(&external.1)
        .status("draft")
        .build();
    deliver(&app, event("invoice.created", created)).await;

    let finalized = invoice("in_renewal", &customer_id).due_in_days(30).build();
    deliver(&app, event("invoice.finalized", finalized)).await;

    let mut conn = app.conn().await;
    let stored = InvoiceRepository::new(&mut conn)
        .get_by_invoice_id("in_renewal")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.subscription_id, Some(external.0));
    assert_eq!(stored.status, InvoiceStatus::Open);
    assert!(stored.due_date.is_some());
}

#[tokio::test]
async fn test_invoice_for_unknown_customer_is_retried_then_dropped() {
    let app = TestApp::new().await;

    deliver(&app, event("invoice.created", invoice("in_orphan", "cus_unknown").build())).await;

    let mut conn = app.conn().await;
    assert!(InvoiceRepository::new(&mut conn)
        .get_by_invoice_id("in_orphan")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_payment_failed_then_paid_toggles_flag() {
    let app = TestApp::new().await;
    let (admin, newsroom) = customer_org(&app, "cus_flaky").await;

    deliver(&app, event("invoice.created", invoice("in_flaky", "cus_flaky").build())).await;
    deliver(
        &app,
        event("invoice.payment_failed", invoice("in_flaky", "cus_flaky").attempt(1).build()),
    )
    .await;

    {
        let mut conn = app.conn().await;
        let flagged = OrganizationRepository::new(&mut conn).get(newsroom.id).await.unwrap().unwrap();
        assert!(flagged.payment_failed);
    }
    let failures = app.mailer.sent_to(admin.email.as_deref().unwrap());
    assert!(failures
        .iter()
        .any(|s| s.email.template == EmailTemplate::PaymentFailed && s.email.subject == "Your payment has failed"));

    deliver(&app, event("invoice.paid", invoice("in_flaky", "cus_flaky").status("paid").build())).await;

    let mut conn = app.conn().await;
    let cleared = OrganizationRepository::new(&mut conn).get(newsroom.id).await.unwrap().unwrap();
    assert!(!cleared.payment_failed);
    let stored = InvoiceRepository::new(&mut conn)
        .get_by_invoice_id("in_flaky")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_final_payment_failure_cancels_subscription() {
    let app = TestApp::new().await;
    let (_admin, newsroom, customer_id) = subscribed_org(&app).await;

    deliver(
        &app,
        event("invoice.payment_failed", invoice("in_final", &customer_id).attempt(4).build()),
    )
    .await;

    assert_eq!(app.gateway.count("cancel_subscription"), 1);
    let mut conn = app.conn().await;
    assert!(SubscriptionRepository::new(&mut conn)
        .current_for_organization(newsroom.id)
        .await
        .unwrap()
        .is_none());
    assert!(app
        .mailer
        .subjects()
        .contains(&"Your subscription has been cancelled".to_string()));
}

#[tokio::test]
async fn test_status_events_update_mirrored_invoice() {
    let app = TestApp::new().await;
    customer_org(&app, "cus_void").await;

    deliver(&app, event("invoice.created", invoice("in_void", "cus_void").build())).await;
    deliver(&app, event("invoice.voided", invoice("in_void", "cus_void").build())).await;

    let mut conn = app.conn().await;
    let stored = InvoiceRepository::new(&mut conn)
        .get_by_invoice_id("in_void")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, InvoiceStatus::Void);
}
