//! Cache invalidation delivery tests

use orgledger::services::invalidation::sign_invalidation;
use orgledger::services::{EntityKind, RequestContext};

use crate::common::{create_client, grant_consent, org, test_config, user, TestApp};

#[tokio::test]
async fn test_changes_in_one_request_are_delivered_once() {
    let app = TestApp::new().await;
    create_client(&app, "search", false).await;
    create_client(&app, "forum", false).await;
    let admin = user().create(&app).await;
    let reporter = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    app.sender.clear();
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership.add_member(&mut ctx, newsroom.id, reporter.id, false).await.unwrap();
    membership.set_admin(&mut ctx, newsroom.id, reporter.id, true).await.unwrap();
    assert_eq!(ctx.pending().ids(EntityKind::User), vec![reporter.id]);
    app.finish(ctx).await;

    assert_eq!(app.sender.mentioning("search", reporter.id), 1);
    assert_eq!(app.sender.mentioning("forum", reporter.id), 1);
    let user_deliveries = app
        .sender
        .deliveries()
        .into_iter()
        .filter(|d| d.payload.kind == EntityKind::User)
        .count();
    assert_eq!(user_deliveries, 2);
}

#[tokio::test]
async fn test_consent_limits_what_a_client_hears() {
    let app = TestApp::new().await;
    let partner = create_client(&app, "partner", true).await;
    let admin = user().create(&app).await;
    let consenting = user().create(&app).await;
    let private = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    grant_consent(&app, &consenting, &partner).await;
    app.sender.clear();
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership.add_member(&mut ctx, newsroom.id, consenting.id, false).await.unwrap();
    membership.add_member(&mut ctx, newsroom.id, private.id, false).await.unwrap();
    app.finish(ctx).await;

    assert_eq!(app.sender.mentioning("partner", consenting.id), 1);
    assert_eq!(app.sender.mentioning("partner", private.id), 0);
}

#[tokio::test]
async fn test_no_consent_means_no_delivery() {
    let app = TestApp::new().await;
    create_client(&app, "partner", true).await;
    let admin = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    app.sender.clear();
    let mut ctx = RequestContext::begin();

    app.services
        .membership()
        .set_admin(&mut ctx, newsroom.id, admin.id, false)
        .await
        .unwrap();
    app.finish(ctx).await;

    assert!(app.sender.deliveries().is_empty());
}

#[tokio::test]
async fn test_disabled_invalidation_sends_nothing() {
    let mut config = test_config();
    config.invalidation.enabled = false;
    let app = TestApp::with_config(config).await;
    create_client(&app, "search", false).await;
    let admin = user().create(&app).await;
    let reporter = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let mut ctx = RequestContext::begin();

    app.services
        .membership()
        .add_member(&mut ctx, newsroom.id, reporter.id, false)
        .await
        .unwrap();
    app.finish(ctx).await;

    assert!(app.sender.deliveries().is_empty());
}

#[tokio::test]
async fn test_teardown_discards_pending_invalidations() {
    let app = TestApp::new().await;
    create_client(&app, "search", false).await;
    let admin = user().create(&app).await;
    let reporter = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    app.sender.clear();
    let mut ctx = RequestContext::begin();

    app.services
        .membership()
        .add_member(&mut ctx, newsroom.id, reporter.id, false)
        .await
        .unwrap();
    ctx.teardown();
    app.run_tasks().await;

    assert!(app.sender.deliveries().is_empty());
}

#[tokio::test]
async fn test_payload_is_signed_with_client_secret() {
    let app = TestApp::new().await;
    create_client(&app, "search", false).await;
    let admin = user().create(&app).await;
    let reporter = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    app.sender.clear();
    let mut ctx = RequestContext::begin();

    app.services
        .membership()
        .add_member(&mut ctx, newsroom.id, reporter.id, false)
        .await
        .unwrap();
    app.finish(ctx).await;

    let deliveries = app.sender.deliveries();
    assert_eq!(deliveries.len(), 1);
    let payload = &deliveries[0].payload;
    assert_eq!(payload.uuids, vec![reporter.id]);
    assert_eq!(
        payload.signature,
        sign_invalidation("client-secret", payload.timestamp, payload.kind, &payload.uuids)
    );
}
