//! Outbound HTTP adapters against a mock server

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use orgledger::config::BillingConfig;
use orgledger::models::ClientApp;
use orgledger::services::billing_gateway::CustomerUpdate;
use orgledger::services::invalidation::{DeliveryError, InvalidationPayload};
use orgledger::services::{BillingGateway, EntityKind, GatewayError, HttpInvalidationSender, InvalidationSender, StripeGateway};

fn gateway(server: &MockServer) -> StripeGateway {
    StripeGateway::new(&BillingConfig {
        api_base: server.uri(),
        secret_key: "sk_test_123".to_string(),
        timeout_secs: 5,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_retrieve_customer_expands_card() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers/cus_1"))
        .and(header("authorization", "Bearer sk_test_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_1",
            "email": "billing@planet.example",
            "default_source": {"object": "card", "id": "card_1", "brand": "Visa", "last4": "4242"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let customer = gateway(&server).retrieve_customer("cus_1").await.unwrap();
    assert_eq!(customer.email.as_deref(), Some("billing@planet.example"));
    let card = customer.card.unwrap();
    assert_eq!(card.last4.as_deref(), Some("4242"));
}

#[tokio::test]
async fn test_bank_account_source_is_not_a_card() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers/cus_2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_2",
            "default_source": {"object": "bank_account", "id": "ba_1"}
        })))
        .mount(&server)
        .await;

    let customer = gateway(&server).retrieve_customer("cus_2").await.unwrap();
    assert!(customer.card.is_none());
}

#[tokio::test]
async fn test_deleted_customer_is_missing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers/cus_gone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_gone", "deleted": true})))
        .mount(&server)
        .await;

    let err = gateway(&server).retrieve_customer("cus_gone").await.unwrap_err();
    assert!(err.is_resource_missing());
}

#[tokio::test]
async fn test_error_responses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers/cus_missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "invalid_request_error", "code": "resource_missing", "message": "No such customer"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/customers/cus_busy"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/customers/cus_declined"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {"type": "card_error", "decline_code": "insufficient_funds", "message": "Your card has insufficient funds."}
        })))
        .mount(&server)
        .await;

    let gateway = gateway(&server);
    assert_eq!(
        gateway.retrieve_customer("cus_missing").await.unwrap_err(),
        GatewayError::ResourceMissing("No such customer".to_string())
    );
    assert_eq!(
        gateway.retrieve_customer("cus_busy").await.unwrap_err(),
        GatewayError::RateLimited
    );
    let declined = gateway
        .update_customer(
            "cus_declined",
            &CustomerUpdate {
                source: Some("tok_chargeDeclined".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        declined,
        GatewayError::Card("Your card has insufficient funds.".to_string())
    );
}

#[tokio::test]
async fn test_update_customer_posts_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/customers/cus_1"))
        .and(body_string_contains("source=tok_visa"))
        .and(body_string_contains("email=billing%40planet.example"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_1"})))
        .expect(1)
        .mount(&server)
        .await;

    gateway(&server)
        .update_customer(
            "cus_1",
            &CustomerUpdate {
                email: Some("billing@planet.example".to_string()),
                source: Some("tok_visa".to_string()),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_subscription_immediately_deletes() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/subscriptions/sub_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "sub_1", "status": "canceled"})))
        .expect(1)
        .mount(&server)
        .await;

    gateway(&server).cancel_subscription("sub_1", false).await.unwrap();
}

#[tokio::test]
async fn test_mark_uncollectible() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/invoices/in_1/mark_uncollectible"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_due": 5000,
            "status": "uncollectible",
            "created": 1_700_000_000
        })))
        .expect(1)
        .mount(&server)
        .await;

    let invoice = gateway(&server).mark_uncollectible("in_1").await.unwrap();
    assert_eq!(invoice.status.as_deref(), Some("uncollectible"));
    assert_eq!(invoice.amount_due, 5000);
}

fn client(server: &MockServer) -> ClientApp {
    ClientApp {
        id: Uuid::new_v4(),
        name: "search".to_string(),
        webhook_url: format!("{}/invalidate", server.uri()),
        secret: "client-secret".to_string(),
        require_consent: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_invalidation_is_posted_as_json() {
    let server = MockServer::start().await;
    let id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/invalidate"))
        .and(header("content-type", "application/json"))
        .and(body_string_contains(id.to_string()))
        .and(body_string_contains("\"kind\":\"user\""))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let payload = InvalidationPayload::signed("client-secret", EntityKind::User, vec![id], Utc::now().timestamp());
    HttpInvalidationSender::new(5)
        .unwrap()
        .send(&client(&server), &payload)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalidation_failure_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invalidate"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let payload = InvalidationPayload::signed("client-secret", EntityKind::Organization, vec![Uuid::new_v4()], 0);
    let err = HttpInvalidationSender::new(5)
        .unwrap()
        .send(&client(&server), &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Status(503)));
}
