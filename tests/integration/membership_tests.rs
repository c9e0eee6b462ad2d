//! Membership and invitation tests

use orgledger::db::{InvitationRepository, MembershipRepository, OrganizationRepository};
use orgledger::models::Invitee;
use orgledger::services::membership::{CAPACITY_EXCEEDED, INVITATION_CLOSED, INVITATION_NEEDS_USER};
use orgledger::services::{EmailTemplate, RequestContext, SubscriptionUpdate};
use orgledger::utils::AppError;

use crate::common::{org, plan, user, TestApp};

fn assert_validation(err: AppError, expected: &str) {
    match err {
        AppError::ValidationError(message) => assert_eq!(message, expected),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_user_count_counts_members_and_open_invites() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().max_users(5).create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    for n in 0..2 {
        membership
            .create_invitation(
                &mut ctx,
                newsroom.id,
                Invitee::Email(format!("invitee{}@example.com", n)),
                false,
                admin.id,
            )
            .await
            .expect("invite should fit");
    }
    for _ in 0..3 {
        let member = user().create(&app).await;
        membership.add_member(&mut ctx, newsroom.id, member.id, false).await.unwrap();
    }
    for _ in 0..3 {
        let requester = user().create(&app).await;
        membership
            .create_invitation(&mut ctx, newsroom.id, Invitee::User(requester.id), true, requester.id)
            .await
            .unwrap();
    }
    app.finish(ctx).await;

    // 4 members + 2 invites; requests hold no seat
    assert_eq!(membership.user_count(newsroom.id).await.unwrap(), 6);
}

#[tokio::test]
async fn test_admin_invite_rejected_at_capacity() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().max_users(2).create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::Email("a@example.com".into()), false, admin.id)
        .await
        .unwrap();
    let err = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::Email("b@example.com".into()), false, admin.id)
        .await
        .unwrap_err();
    assert_validation(err, CAPACITY_EXCEEDED);

    // Join requests are not capacity checked
    let requester = user().create(&app).await;
    membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::User(requester.id), true, requester.id)
        .await
        .expect("join request should not need a seat");
    ctx.teardown();
}

#[tokio::test]
async fn test_non_admin_cannot_invite() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();
    membership.add_member(&mut ctx, newsroom.id, member.id, false).await.unwrap();

    let err = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::Email("x@example.com".into()), false, member.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    ctx.teardown();
}

#[tokio::test]
async fn test_join_request_must_come_from_invitee() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let other = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let mut ctx = RequestContext::begin();

    let err = app
        .services
        .membership()
        .create_invitation(&mut ctx, newsroom.id, Invitee::User(other.id), true, admin.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    ctx.teardown();
}

#[tokio::test]
async fn test_join_request_emails_admins() {
    let app = TestApp::new().await;
    let admin = user().with_email("editor@planet.example").create(&app).await;
    let requester = user().create(&app).await;
    let newsroom = org().named("Daily Planet").create(&app, &admin).await;
    let mut ctx = RequestContext::begin();

    app.services
        .membership()
        .create_invitation(&mut ctx, newsroom.id, Invitee::User(requester.id), true, requester.id)
        .await
        .unwrap();
    app.finish(ctx).await;

    let sent = app.mailer.sent_to("editor@planet.example");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].email.template, EmailTemplate::JoinRequest);
    assert_eq!(
        sent[0].email.subject,
        format!("{} has requested to join Daily Planet", requester.name)
    );
}

#[tokio::test]
async fn test_closed_invitation_cannot_transition_again() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let invitee = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    let accepted = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::User(invitee.id), false, admin.id)
        .await
        .unwrap();
    membership.accept(&mut ctx, accepted.id, None).await.unwrap();
    assert_validation(membership.accept(&mut ctx, accepted.id, None).await.unwrap_err(), INVITATION_CLOSED);
    assert_validation(membership.reject(&mut ctx, accepted.id).await.unwrap_err(), INVITATION_CLOSED);

    let rejected = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::Email("gone@example.com".into()), false, admin.id)
        .await
        .unwrap();
    membership.reject(&mut ctx, rejected.id).await.unwrap();
    assert_validation(membership.reject(&mut ctx, rejected.id).await.unwrap_err(), INVITATION_CLOSED);
    assert_validation(
        membership.accept(&mut ctx, rejected.id, Some(invitee.id)).await.unwrap_err(),
        INVITATION_CLOSED,
    );

    let mut conn = app.conn().await;
    let stored = InvitationRepository::new(&mut conn).get(rejected.id).await.unwrap().unwrap();
    assert!(stored.rejected_at.is_some());
    assert!(stored.accepted_at.is_none());
    ctx.teardown();
}

#[tokio::test]
async fn test_email_invite_needs_user_to_accept() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    let invitation = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::Email("Reporter@Example.com".into()), false, admin.id)
        .await
        .unwrap();
    assert_eq!(invitation.email.as_deref(), Some("reporter@example.com"));

    assert_validation(
        membership.accept(&mut ctx, invitation.id, None).await.unwrap_err(),
        INVITATION_NEEDS_USER,
    );
    ctx.teardown();
}

#[tokio::test]
async fn test_accept_never_duplicates_membership() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership.add_member(&mut ctx, newsroom.id, member.id, false).await.unwrap();
    let invitation = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::User(member.id), true, member.id)
        .await
        .unwrap();
    membership.accept(&mut ctx, invitation.id, None).await.unwrap();

    let mut conn = app.conn().await;
    let members = MembershipRepository::new(&mut conn)
        .list_for_organization(newsroom.id)
        .await
        .unwrap();
    assert_eq!(members.iter().filter(|m| m.user_id == member.id).count(), 1);
    ctx.teardown();
}

#[tokio::test]
async fn test_add_member_twice_conflicts() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership.add_member(&mut ctx, newsroom.id, member.id, false).await.unwrap();
    let err = membership.add_member(&mut ctx, newsroom.id, member.id, true).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    ctx.teardown();
}

#[tokio::test]
async fn test_accepting_verified_organization_verifies_user() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let reporter = user().with_email("reporter@example.com").create(&app).await;
    let newsroom = org().verified_journalist().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    let invitation = membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::User(reporter.id), false, admin.id)
        .await
        .unwrap();
    membership.accept(&mut ctx, invitation.id, None).await.unwrap();
    app.finish(ctx).await;

    let mut conn = app.conn().await;
    let stored = orgledger::db::UserRepository::new(&mut conn)
        .get(reporter.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.verified_journalist);
    assert!(app
        .mailer
        .sent_to("reporter@example.com")
        .iter()
        .any(|s| s.email.template == EmailTemplate::Verified));
}

#[tokio::test]
async fn test_auto_join_requires_matching_verified_domain() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let colleague = user().with_email("lois@planet.example").create(&app).await;
    let outsider = user().with_email("lex@luthorcorp.example").create(&app).await;
    let unverified = user().with_email("jimmy@planet.example").unverified().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let mut ctx = RequestContext::begin();

    let orgs = app.services.organizations();
    orgs.add_email_domain(&mut ctx, newsroom.id, "Planet.Example").await.unwrap();
    orgs.set_allow_auto_join(&mut ctx, newsroom.id, true).await.unwrap();

    let membership = app.services.membership();
    membership.auto_join(&mut ctx, newsroom.id, colleague.id).await.unwrap();
    assert!(matches!(
        membership.auto_join(&mut ctx, newsroom.id, outsider.id).await,
        Err(AppError::Forbidden(_))
    ));
    assert!(matches!(
        membership.auto_join(&mut ctx, newsroom.id, unverified.id).await,
        Err(AppError::Forbidden(_))
    ));
    ctx.teardown();
}

#[tokio::test]
async fn test_auto_join_disabled_is_forbidden() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let colleague = user().with_email("lois@planet.example").create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let mut ctx = RequestContext::begin();

    app.services
        .organizations()
        .add_email_domain(&mut ctx, newsroom.id, "planet.example")
        .await
        .unwrap();
    let result = app.services.membership().auto_join(&mut ctx, newsroom.id, colleague.id).await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));
    ctx.teardown();
}

#[tokio::test]
async fn test_remove_last_admin_is_allowed() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership.remove_member(&mut ctx, newsroom.id, admin.id).await.unwrap();
    assert_eq!(membership.user_count(newsroom.id).await.unwrap(), 0);

    let err = membership.remove_member(&mut ctx, newsroom.id, admin.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    ctx.teardown();
}

#[tokio::test]
async fn test_set_admin_promotes_member() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let membership = app.services.membership();
    let mut ctx = RequestContext::begin();

    membership.add_member(&mut ctx, newsroom.id, member.id, false).await.unwrap();
    membership.set_admin(&mut ctx, newsroom.id, member.id, true).await.unwrap();
    membership
        .create_invitation(&mut ctx, newsroom.id, Invitee::Email("new@example.com".into()), false, member.id)
        .await
        .expect("promoted member may invite");
    ctx.teardown();
}

#[tokio::test]
async fn test_new_member_of_roster_plan_is_synced() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let roster_plan = plan().free().roster_sync().create(&app).await;
    let mut ctx = RequestContext::begin();

    app.services
        .billing()
        .set_subscription(
            &mut ctx,
            newsroom.id,
            orgledger::services::SubscriptionUpdate {
                plan_id: Some(roster_plan.id),
                max_users: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    app.services
        .membership()
        .add_member(&mut ctx, newsroom.id, member.id, false)
        .await
        .unwrap();
    app.finish(ctx).await;

    let synced = app.roster.synced();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].0.organization_id, newsroom.id);
    assert_eq!(synced[0].0.plan_id, roster_plan.id);
    assert_eq!(synced[0].1, member.id);
}

async fn subscribe(app: &TestApp, ctx: &mut RequestContext, organization_id: uuid::Uuid, plan_id: uuid::Uuid) {
    app.services
        .billing()
        .set_subscription(
            ctx,
            organization_id,
            SubscriptionUpdate {
                plan_id: Some(plan_id),
                max_users: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_new_member_synced_through_group_plan() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let network = org().create(&app, &admin).await;
    let network_plan = plan().free().roster_sync().create(&app).await;
    {
        let mut conn = app.conn().await;
        OrganizationRepository::new(&mut conn)
            .add_to_group(network.id, newsroom.id)
            .await
            .unwrap();
    }
    let mut ctx = RequestContext::begin();
    subscribe(&app, &mut ctx, network.id, network_plan.id).await;

    app.services
        .membership()
        .add_member(&mut ctx, newsroom.id, member.id, false)
        .await
        .unwrap();
    app.finish(ctx).await;

    let synced = app.roster.synced();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].0.organization_id, network.id);
    assert_eq!(synced[0].0.plan_id, network_plan.id);
}

#[tokio::test]
async fn test_own_roster_plan_takes_priority_over_group_plan() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let member = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let network = org().create(&app, &admin).await;
    let own_plan = plan().free().roster_sync().create(&app).await;
    let network_plan = plan().free().roster_sync().create(&app).await;
    {
        let mut conn = app.conn().await;
        OrganizationRepository::new(&mut conn)
            .add_to_group(network.id, newsroom.id)
            .await
            .unwrap();
    }
    let mut ctx = RequestContext::begin();
    subscribe(&app, &mut ctx, network.id, network_plan.id).await;
    subscribe(&app, &mut ctx, newsroom.id, own_plan.id).await;

    app.services
        .membership()
        .add_member(&mut ctx, newsroom.id, member.id, false)
        .await
        .unwrap();
    app.finish(ctx).await;

    let synced = app.roster.synced();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].0.organization_id, newsroom.id);
    assert_eq!(synced[0].0.plan_id, own_plan.id);
    assert_eq!(synced[0].1, member.id);
}
