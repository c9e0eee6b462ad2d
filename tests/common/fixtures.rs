//! Webhook payload fixtures
//!
//! Builders for the event envelopes the billing provider POSTs to
//! `/webhooks/billing`.

use chrono::Utc;
use serde_json::{json, Value};

/// Wrap `object` in a `{type, data: {object}}` envelope
pub fn event(event_type: &str, object: Value) -> Vec<u8> {
    json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": event_type,
        "data": { "object": object },
    })
    .to_string()
    .into_bytes()
}

/// Invoice object builder
pub struct InvoiceFixture {
    value: Value,
}

pub fn invoice(id: &str, customer: &str) -> InvoiceFixture {
    InvoiceFixture {
        value: json!({
            "id": id,
            "customer": customer,
            "amount_due": 15000,
            "status": "open",
            "created": Utc::now().timestamp(),
            "attempt_count": 0,
            "lines": { "data": [] },
        }),
    }
}

impl InvoiceFixture {
    pub fn subscription(mut self, subscription_id: &str) -> Self {
        self.value["parent"] = json!({
            "subscription_details": { "subscription": subscription_id }
        });
        self
    }

    pub fn price(mut self, price_id: &str) -> Self {
        self.value["lines"] = json!({ "data": [{ "plan": { "id": price_id } }] });
        self
    }

    pub fn amount(mut self, amount: i64) -> Self {
        self.value["amount_due"] = json!(amount);
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.value["status"] = json!(status);
        self
    }

    pub fn due_in_days(mut self, days: i64) -> Self {
        self.value["due_date"] = json!(Utc::now().timestamp() + days * 86_400);
        self
    }

    pub fn attempt(mut self, attempt_count: i64) -> Self {
        self.value["attempt_count"] = json!(attempt_count);
        self
    }

    pub fn build(self) -> Value {
        self.value
    }
}

pub fn charge(id: &str, customer: Option<&str>, amount: i64) -> Value {
    json!({
        "id": id,
        "amount": amount,
        "customer": customer,
        "invoice": null,
        "description": "One-off payment",
        "metadata": { "fee amount": "5" },
        "created": Utc::now().timestamp(),
    })
}
