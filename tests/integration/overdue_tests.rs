//! Overdue invoice sweep tests

use chrono::{Duration, NaiveDate, Utc};
use uuid::Uuid;

use orgledger::db::{
    ChangeLogRepository, InvoiceRepository, InvoiceUpsert, OrganizationRepository, SubscriptionRepository,
};
use orgledger::models::{ChangeLogReason, Invoice, InvoiceStatus, Organization, User};
use orgledger::services::billing_gateway::{GatewayInvoice, InvoiceLines};
use orgledger::services::{run_sweep, EmailTemplate, GatewayError, OverdueAction, RequestContext, Sweep, SubscriptionUpdate};

use crate::common::{org, plan, user, TestApp};

async fn paying_org(app: &TestApp) -> (User, Organization) {
    let admin = user().with_email(&format!("admin-{}@planet.example", Uuid::new_v4().simple())).create(app).await;
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
        .expect("paid subscription");
    ctx.teardown();
    (admin, newsroom)
}

/// Mirror an open invoice due on `due` both at the provider and locally
async fn open_invoice(app: &TestApp, organization_id: Uuid, due: NaiveDate) -> Invoice {
    let invoice_id = format!("in_overdue_{}", Uuid::new_v4().simple());
    app.gateway.add_invoice(GatewayInvoice {
        id: invoice_id.clone(),
        customer: None,
        subscription: None,
        parent: None,
        amount_due: 5000,
        status: Some("open".to_string()),
        due_date: None,
        created: Utc::now().timestamp(),
        attempt_count: 0,
        lines: InvoiceLines::default(),
    });

    let mut conn = app.conn().await;
    InvoiceRepository::new(&mut conn)
        .upsert(&InvoiceUpsert {
            invoice_id,
            organization_id,
            subscription_id: None,
            amount: 5000,
            due_date: Some(due),
            status: InvoiceStatus::Open,
            created_at: Utc::now(),
        })
        .await
        .unwrap()
}

fn overdue_emails(app: &TestApp, address: &str) -> usize {
    app.mailer
        .sent_to(address)
        .iter()
        .filter(|s| s.email.template == EmailTemplate::InvoiceOverdue)
        .count()
}

#[tokio::test]
async fn test_rerunning_sweep_sends_one_reminder() {
    let app = TestApp::new().await;
    let (admin, newsroom) = paying_org(&app).await;
    let today = Utc::now().date_naive();
    open_invoice(&app, newsroom.id, today - Duration::days(10)).await;

    for _ in 0..2 {
        let queued = run_sweep(&app.services, Sweep::Overdue, today).await.unwrap();
        assert_eq!(queued, 1);
        app.run_tasks().await;
    }

    assert_eq!(overdue_emails(&app, admin.email.as_deref().unwrap()), 1);
    let mut conn = app.conn().await;
    let flagged = OrganizationRepository::new(&mut conn).get(newsroom.id).await.unwrap().unwrap();
    assert!(flagged.payment_failed);
}

#[tokio::test]
async fn test_reminders_are_spaced_by_interval() {
    let app = TestApp::new().await;
    let (_admin, newsroom) = paying_org(&app).await;
    let due = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    let invoice = open_invoice(&app, newsroom.id, due).await;
    let invoices = app.services.invoices();

    let mut actions = Vec::new();
    for day in [11, 11, 12, 14] {
        let mut ctx = RequestContext::begin();
        let today = NaiveDate::from_ymd_opt(2025, 3, day).unwrap();
        actions.push(invoices.process_overdue_invoice(&mut ctx, invoice.id, today).await.unwrap());
        ctx.teardown();
    }

    assert_eq!(
        actions,
        vec![
            OverdueAction::Remind {
                days_overdue: 10,
                days_until_cancellation: 20
            },
            OverdueAction::Flag { days_overdue: 10 },
            OverdueAction::Flag { days_overdue: 11 },
            OverdueAction::Remind {
                days_overdue: 13,
                days_until_cancellation: 17
            },
        ]
    );
}

#[tokio::test]
async fn test_grace_elapsed_cancels_and_writes_off() {
    let app = TestApp::new().await;
    let (admin, newsroom) = paying_org(&app).await;
    let today = Utc::now().date_naive();
    let invoice = open_invoice(&app, newsroom.id, today - Duration::days(31)).await;
    let mut ctx = RequestContext::begin();

    let action = app
        .services
        .invoices()
        .process_overdue_invoice(&mut ctx, invoice.id, today)
        .await
        .unwrap();
    app.finish(ctx).await;

    assert_eq!(action, OverdueAction::Cancel { days_overdue: 31 });
    assert_eq!(app.gateway.count("cancel_subscription"), 1);
    assert_eq!(app.gateway.count("mark_uncollectible"), 1);
    assert_eq!(
        app.gateway.invoice(&invoice.invoice_id).and_then(|i| i.status).as_deref(),
        Some("uncollectible")
    );

    let mut conn = app.conn().await;
    let stored = InvoiceRepository::new(&mut conn).get(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Uncollectible);
    assert!(SubscriptionRepository::new(&mut conn)
        .current_for_organization(newsroom.id)
        .await
        .unwrap()
        .is_none());
    let logs = ChangeLogRepository::new(&mut conn)
        .list_for_organization(newsroom.id)
        .await
        .unwrap();
    assert_eq!(logs.last().map(|l| l.reason), Some(ChangeLogReason::Failed));

    let cancelled = app.mailer.sent_to(admin.email.as_deref().unwrap());
    assert!(cancelled.iter().any(|s| s.email.template == EmailTemplate::InvoiceCancelled));

    // Reprocessing a written-off invoice does nothing
    let mut ctx = RequestContext::begin();
    let again = app
        .services
        .invoices()
        .process_overdue_invoice(&mut ctx, invoice.id, today)
        .await
        .unwrap();
    ctx.teardown();
    assert_eq!(again, OverdueAction::Skip);
}

#[tokio::test]
async fn test_failed_write_off_keeps_invoice_open() {
    let app = TestApp::new().await;
    let (_admin, newsroom) = paying_org(&app).await;
    let today = Utc::now().date_naive();
    let invoice = open_invoice(&app, newsroom.id, today - Duration::days(45)).await;
    app.gateway.fail(
        "mark_uncollectible",
        GatewayError::Api {
            status: 500,
            message: "boom".to_string(),
        },
    );
    let mut ctx = RequestContext::begin();

    let action = app
        .services
        .invoices()
        .process_overdue_invoice(&mut ctx, invoice.id, today)
        .await
        .unwrap();
    ctx.teardown();

    assert!(matches!(action, OverdueAction::Cancel { .. }));
    let mut conn = app.conn().await;
    let stored = InvoiceRepository::new(&mut conn).get(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Open);
    assert!(SubscriptionRepository::new(&mut conn)
        .current_for_organization(newsroom.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_paid_and_future_invoices_are_not_swept() {
    let app = TestApp::new().await;
    let (_admin, newsroom) = paying_org(&app).await;
    let today = Utc::now().date_naive();
    let paid = open_invoice(&app, newsroom.id, today - Duration::days(5)).await;
    open_invoice(&app, newsroom.id, today + Duration::days(5)).await;
    {
        let mut conn = app.conn().await;
        InvoiceRepository::new(&mut conn)
            .set_status(&paid.invoice_id, InvoiceStatus::Paid, None)
            .await
            .unwrap();
    }

    let queued = app.services.invoices().check_overdue_invoices(today).await.unwrap();
    assert_eq!(queued, 0);
}
