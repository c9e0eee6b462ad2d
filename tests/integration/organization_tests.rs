//! Organization lifecycle tests: registration, merge, change requests

use orgledger::db::{MembershipRepository, OrganizationRepository, PlanRepository, ReceiptEmailRepository};
use orgledger::models::{ChangeRequestStatus, CreateUserRequest, Invitee, OrganizationState, ProfileFields};
use orgledger::services::{EmailTemplate, RequestContext, SubscriptionUpdate};
use orgledger::utils::AppError;

use crate::common::{org, plan, user, TestApp};

async fn member_ids(app: &TestApp, organization_id: uuid::Uuid) -> Vec<uuid::Uuid> {
    let mut conn = app.conn().await;
    let mut ids: Vec<_> = MembershipRepository::new(&mut conn)
        .list_for_organization(organization_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.user_id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_register_user_creates_individual_organization() {
    let app = TestApp::new().await;
    let mut ctx = RequestContext::begin();

    let (created, individual) = app
        .services
        .organizations()
        .register_user(
            &mut ctx,
            CreateUserRequest {
                username: "clark.kent".to_string(),
                name: "Clark Kent".to_string(),
                email: Some("clark@planet.example".to_string()),
                email_verified: true,
                is_staff: false,
            },
        )
        .await
        .unwrap();
    ctx.teardown();

    assert_eq!(individual.id, created.id);
    assert!(individual.individual);
    assert_eq!(individual.max_users, 1);
    assert_eq!(individual.slug, "clark-kent");
    assert_eq!(member_ids(&app, individual.id).await, vec![created.id]);

    let mut conn = app.conn().await;
    let membership = MembershipRepository::new(&mut conn)
        .get(created.id, individual.id)
        .await
        .unwrap()
        .unwrap();
    assert!(membership.admin);
    let receipts = ReceiptEmailRepository::new(&mut conn).list(individual.id).await.unwrap();
    assert_eq!(receipts, vec!["clark@planet.example".to_string()]);
}

#[tokio::test]
async fn test_register_user_rejects_bad_username() {
    let app = TestApp::new().await;
    let mut ctx = RequestContext::begin();

    let err = app
        .services
        .organizations()
        .register_user(
            &mut ctx,
            CreateUserRequest {
                username: "clark kent".to_string(),
                name: String::new(),
                email: None,
                email_verified: false,
                is_staff: false,
            },
        )
        .await
        .unwrap_err();
    ctx.teardown();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_merge_moves_members_and_marks_source() {
    let app = TestApp::new().await;
    let u1 = user().create(&app).await;
    let u2 = user().create(&app).await;
    let target = org().create(&app, &u1).await;
    let source = org().create(&app, &u1).await;
    let mut ctx = RequestContext::begin();
    app.services
        .membership()
        .add_member(&mut ctx, source.id, u2.id, false)
        .await
        .unwrap();

    app.services
        .organizations()
        .merge(&mut ctx, target.id, source.id, Some(u1.id))
        .await
        .unwrap();
    ctx.teardown();

    let mut expected = vec![u1.id, u2.id];
    expected.sort();
    assert_eq!(member_ids(&app, target.id).await, expected);
    assert!(member_ids(&app, source.id).await.is_empty());

    let mut conn = app.conn().await;
    let merged = OrganizationRepository::new(&mut conn).get(source.id).await.unwrap().unwrap();
    assert!(merged.private);
    assert_eq!(merged.state, OrganizationState::MergedInto(target.id));
    assert_eq!(merged.merge.as_ref().and_then(|m| m.merged_by), Some(u1.id));
}

#[tokio::test]
async fn test_merge_moves_relations_and_plan_grants() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let target = org().create(&app, &admin).await;
    let source = org().create(&app, &admin).await;
    let mut bureau = org().create(&app, &admin).await;
    let network = org().create(&app, &admin).await;
    let affiliate = org().create(&app, &admin).await;
    let partner_plan = plan().private().create(&app).await;
    {
        let mut conn = app.conn().await;
        let mut orgs = OrganizationRepository::new(&mut conn);
        bureau.parent_id = Some(source.id);
        orgs.save(&bureau).await.unwrap();
        orgs.add_to_group(network.id, source.id).await.unwrap();
        orgs.add_to_group(source.id, affiliate.id).await.unwrap();
        orgs.add_url(source.id, "https://source.example").await.unwrap();
        orgs.add_subtype(source.id, "nonprofit").await.unwrap();
        orgs.add_email_domain(source.id, "Source.Example").await.unwrap();
        PlanRepository::new(&mut conn)
            .grant(partner_plan.id, source.id)
            .await
            .unwrap();
    }

    let mut ctx = RequestContext::begin();
    app.services
        .organizations()
        .merge(&mut ctx, target.id, source.id, Some(admin.id))
        .await
        .unwrap();
    ctx.teardown();

    let mut conn = app.conn().await;
    let mut orgs = OrganizationRepository::new(&mut conn);
    assert_eq!(orgs.child_ids(target.id).await.unwrap(), vec![bureau.id]);
    assert!(orgs.child_ids(source.id).await.unwrap().is_empty());
    let groups: Vec<_> = orgs.groups_of(target.id).await.unwrap().into_iter().map(|g| g.id).collect();
    assert_eq!(groups, vec![network.id]);
    assert!(orgs.groups_of(source.id).await.unwrap().is_empty());
    assert_eq!(orgs.member_ids(target.id).await.unwrap(), vec![affiliate.id]);
    assert!(orgs.member_ids(source.id).await.unwrap().is_empty());
    assert_eq!(orgs.urls(target.id).await.unwrap(), vec!["https://source.example".to_string()]);
    assert_eq!(orgs.subtypes(target.id).await.unwrap(), vec!["nonprofit".to_string()]);
    assert_eq!(orgs.email_domains(target.id).await.unwrap(), vec!["source.example".to_string()]);
    assert!(orgs.urls(source.id).await.unwrap().is_empty());
    assert!(orgs.email_domains(source.id).await.unwrap().is_empty());

    let mut plans = PlanRepository::new(&mut conn);
    assert_eq!(plans.granted_plan_ids(target.id).await.unwrap(), vec![partner_plan.id]);
    assert!(plans.granted_plan_ids(source.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_merged_organization_cannot_be_joined_or_merged_again() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let target = org().create(&app, &admin).await;
    let source = org().create(&app, &admin).await;
    let other = org().create(&app, &admin).await;
    let orgs = app.services.organizations();
    let mut ctx = RequestContext::begin();

    orgs.merge(&mut ctx, target.id, source.id, None).await.unwrap();

    assert!(matches!(
        orgs.merge(&mut ctx, other.id, source.id, None).await,
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        orgs.merge(&mut ctx, source.id, other.id, None).await,
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        app.services
            .membership()
            .create_invitation(&mut ctx, source.id, Invitee::Email("x@example.com".into()), false, admin.id)
            .await,
        Err(AppError::ValidationError(_))
    ));
    ctx.teardown();
}

#[tokio::test]
async fn test_merge_preconditions() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let target = org().create(&app, &admin).await;
    let paying = org().create(&app, &admin).await;
    let paid = plan().create(&app).await;
    let orgs = app.services.organizations();
    let mut ctx = RequestContext::begin();

    assert!(matches!(
        orgs.merge(&mut ctx, target.id, target.id, None).await,
        Err(AppError::ValidationError(_))
    ));

    // individual organizations share the user's id
    assert!(matches!(
        orgs.merge(&mut ctx, target.id, admin.id, None).await,
        Err(AppError::ValidationError(_))
    ));

    app.services
        .billing()
        .set_subscription(
            &mut ctx,
            paying.id,
            SubscriptionUpdate {
                plan_id: Some(paid.id),
                max_users: 5,
                token: Some("tok_visa".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        orgs.merge(&mut ctx, target.id, paying.id, None).await,
        Err(AppError::ValidationError(_))
    ));
    ctx.teardown();

    // Nothing moved
    assert_eq!(member_ids(&app, paying.id).await, vec![admin.id]);
}

#[tokio::test]
async fn test_merge_moves_receipt_emails() {
    let app = TestApp::new().await;
    let admin = user().with_email("admin@planet.example").create(&app).await;
    let target = org().create(&app, &admin).await;
    let source = org().create(&app, &admin).await;
    let orgs = app.services.organizations();
    let mut ctx = RequestContext::begin();

    orgs.set_receipt_emails(&mut ctx, source.id, &["Accounts@Planet.example".to_string()])
        .await
        .unwrap();
    orgs.merge(&mut ctx, target.id, source.id, None).await.unwrap();
    ctx.teardown();

    let mut conn = app.conn().await;
    let mut receipts = ReceiptEmailRepository::new(&mut conn).list(target.id).await.unwrap();
    receipts.sort();
    assert_eq!(
        receipts,
        vec!["accounts@planet.example".to_string(), "admin@planet.example".to_string()]
    );
}

#[tokio::test]
async fn test_set_receipt_emails_normalizes_and_validates() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let orgs = app.services.organizations();
    let mut ctx = RequestContext::begin();

    let saved = orgs
        .set_receipt_emails(
            &mut ctx,
            newsroom.id,
            &[
                "Billing@Planet.example".to_string(),
                "billing@planet.example".to_string(),
                "ap@planet.example".to_string(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(saved, vec!["billing@planet.example", "ap@planet.example"]);

    let err = orgs
        .set_receipt_emails(&mut ctx, newsroom.id, &["not-an-email".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    ctx.teardown();
}

#[tokio::test]
async fn test_change_request_ticket_and_acceptance() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().named("Daily Planet").create(&app, &admin).await;
    let orgs = app.services.organizations();
    let mut ctx = RequestContext::begin();

    let request = orgs
        .submit_change_request(
            &mut ctx,
            newsroom.id,
            admin.id,
            ProfileFields {
                name: "The Daily Planet".to_string(),
                city: "Metropolis".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(request.status, ChangeRequestStatus::Pending);
    assert_eq!(request.previous.as_ref().map(|p| p.name.as_str()), Some("Daily Planet"));

    let updated = orgs.accept_change_request(&mut ctx, request.id).await.unwrap();
    assert_eq!(updated.name, "The Daily Planet");
    assert_eq!(updated.city, "Metropolis");
    assert_eq!(updated.slug, newsroom.slug);

    assert!(matches!(
        orgs.accept_change_request(&mut ctx, request.id).await,
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        orgs.reject_change_request(&mut ctx, request.id).await,
        Err(AppError::ValidationError(_))
    ));
    app.finish(ctx).await;

    let tickets = app.mailer.sent_to("support@orgledger.test");
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].email.template, EmailTemplate::ChangeRequestTicket);
}

#[tokio::test]
async fn test_staff_change_request_opens_no_ticket() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let staff = user().staff().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let orgs = app.services.organizations();
    let mut ctx = RequestContext::begin();

    let request = orgs
        .submit_change_request(
            &mut ctx,
            newsroom.id,
            staff.id,
            ProfileFields {
                country: "CA".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    orgs.reject_change_request(&mut ctx, request.id).await.unwrap();
    app.finish(ctx).await;

    assert!(app.mailer.sent_to("support@orgledger.test").is_empty());
    let mut conn = app.conn().await;
    let unchanged = OrganizationRepository::new(&mut conn).get(newsroom.id).await.unwrap().unwrap();
    assert_eq!(unchanged.country, newsroom.country);
}

#[tokio::test]
async fn test_blank_change_request_is_rejected() {
    let app = TestApp::new().await;
    let admin = user().create(&app).await;
    let newsroom = org().create(&app, &admin).await;
    let mut ctx = RequestContext::begin();

    let err = app
        .services
        .organizations()
        .submit_change_request(&mut ctx, newsroom.id, admin.id, ProfileFields::default())
        .await
        .unwrap_err();
    ctx.teardown();
    assert!(matches!(err, AppError::BadRequest(_)));
}
