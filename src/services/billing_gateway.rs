//! Billing provider adapter
//!
//! [`BillingGateway`] is the seam between the billing engine and the payment
//! provider. [`StripeGateway`] talks to the Stripe REST API with form-encoded
//! requests; tests substitute an in-memory implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::BillingConfig;
use crate::models::InvoiceStatus;

type HmacSha256 = Hmac<Sha256>;

/// Failure reported by the billing provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The referenced provider object does not exist (stale id)
    #[error("resource missing: {0}")]
    ResourceMissing(String),

    #[error("rate limited by billing provider")]
    RateLimited,

    /// Declined card or no usable payment source
    #[error("card error: {0}")]
    Card(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("billing provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Errors worth retrying from a background task
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RateLimited | GatewayError::Network(_) => true,
            GatewayError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_resource_missing(&self) -> bool {
        matches!(self, GatewayError::ResourceMissing(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ResourceMissing(_) => "resource_missing",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::Card(_) => "card_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Api { .. } => "api_error",
            GatewayError::Network(_) => "network_error",
            GatewayError::Decode(_) => "decode_error",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Card on file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCard {
    pub id: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub exp_month: Option<u32>,
    #[serde(default)]
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    pub email: Option<String>,
    pub card: Option<GatewayCard>,
}

/// Changes applied to a provider customer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerUpdate {
    pub email: Option<String>,
    /// Card token to become the default source
    pub source: Option<String>,
}

/// How the provider collects a subscription's payments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMethod {
    ChargeAutomatically,
    SendInvoice { days_until_due: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: i64,
    pub collection: CollectionMethod,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub price_id: String,
    pub quantity: i64,
    pub collection: CollectionMethod,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    #[serde(default)]
    pub latest_invoice: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
}

/// Provider invoice as delivered by the API and by webhooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub attempt_count: i64,
    #[serde(default)]
    pub lines: InvoiceLines,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub plan: Option<PriceRef>,
    #[serde(default)]
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

impl GatewayInvoice {
    /// Provider subscription id, preferring the parent details
    pub fn subscription_id(&self) -> Option<&str> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
            .and_then(|d| d.subscription.as_deref())
            .or(self.subscription.as_deref())
    }

    /// Price id of the first invoice line
    pub fn plan_id(&self) -> Option<&str> {
        self.lines.data.first().and_then(|line| {
            line.plan
                .as_ref()
                .or(line.price.as_ref())
                .map(|p| p.id.as_str())
        })
    }

    pub fn invoice_status(&self) -> InvoiceStatus {
        self.status
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(InvoiceStatus::Draft)
    }

    pub fn due_on(&self) -> Option<NaiveDate> {
        self.due_date.and_then(timestamp_to_utc).map(|t| t.date_naive())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        timestamp_to_utc(self.created).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub customer_id: Option<String>,
    /// Card token for a one-off charge without saving it
    pub source: Option<String>,
    pub amount: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

/// Provider charge as delivered by the API and by webhooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub created: i64,
}

impl GatewayCharge {
    pub fn created_at(&self) -> DateTime<Utc> {
        timestamp_to_utc(self.created).unwrap_or_else(Utc::now)
    }
}

pub(crate) fn timestamp_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

/// Operations the billing engine needs from the payment provider
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn create_customer(&self, email: Option<&str>, description: &str) -> GatewayResult<GatewayCustomer>;

    /// Fails with [`GatewayError::ResourceMissing`] for unknown or deleted customers
    async fn retrieve_customer(&self, customer_id: &str) -> GatewayResult<GatewayCustomer>;

    async fn update_customer(&self, customer_id: &str, update: &CustomerUpdate) -> GatewayResult<GatewayCustomer>;

    async fn create_subscription(&self, request: &SubscriptionRequest) -> GatewayResult<GatewaySubscription>;

    async fn modify_subscription(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
    ) -> GatewayResult<GatewaySubscription>;

    /// Cancel at period end, or immediately when `at_period_end` is false
    async fn cancel_subscription(&self, subscription_id: &str, at_period_end: bool) -> GatewayResult<()>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice>;

    async fn modify_invoice(
        &self,
        invoice_id: &str,
        metadata: &HashMap<String, String>,
    ) -> GatewayResult<GatewayInvoice>;

    async fn mark_uncollectible(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice>;

    async fn create_charge(&self, request: &ChargeRequest) -> GatewayResult<GatewayCharge>;
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<String>,
    message: Option<String>,
    param: Option<String>,
    decline_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    default_source: Option<serde_json::Value>,
}

impl StripeCustomer {
    fn into_customer(self) -> GatewayResult<GatewayCustomer> {
        if self.deleted {
            return Err(GatewayError::ResourceMissing(format!("customer {} was deleted", self.id)));
        }
        // default_source is only an object when expanded, and only cards count
        let card = self
            .default_source
            .filter(|v| v.get("object").and_then(|o| o.as_str()) == Some("card"))
            .and_then(|v| serde_json::from_value(v).ok());
        Ok(GatewayCustomer {
            id: self.id,
            email: self.email,
            card,
        })
    }
}

/// Stripe REST client
pub struct StripeGateway {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(config: &BillingConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        context: &str,
    ) -> GatewayResult<T> {
        let resp = self
            .http
            .post(self.url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .form(form)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, context).await?;
        Ok(resp.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, context: &str) -> GatewayResult<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .send()
            .await?;
        let resp = Self::ensure_success(resp, context).await?;
        Ok(resp.json().await?)
    }

    async fn ensure_success(resp: reqwest::Response, context: &str) -> GatewayResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("request-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };

        let details = serde_json::from_str::<StripeErrorEnvelope>(&body)
            .map(|envelope| envelope.error)
            .ok();

        error!(
            status = %status,
            stripe_request_id = ?request_id,
            stripe_error_type = ?details.as_ref().and_then(|d| d.type_.as_deref()),
            stripe_error_code = ?details.as_ref().and_then(|d| d.code.as_deref()),
            stripe_error_param = ?details.as_ref().and_then(|d| d.param.as_deref()),
            stripe_decline_code = ?details.as_ref().and_then(|d| d.decline_code.as_deref()),
            context = %context,
            "billing provider request failed"
        );

        Err(classify_error(status.as_u16(), details.as_ref(), context))
    }
}

fn classify_error(status: u16, details: Option<&StripeErrorDetails>, context: &str) -> GatewayError {
    let message = details
        .and_then(|d| d.message.clone())
        .unwrap_or_else(|| format!("{} failed", context));
    let code = details.and_then(|d| d.code.as_deref());
    let kind = details.and_then(|d| d.type_.as_deref());

    if status == 429 || code == Some("rate_limit") {
        GatewayError::RateLimited
    } else if status == 404 || code == Some("resource_missing") {
        GatewayError::ResourceMissing(message)
    } else if status == 402 || kind == Some("card_error") {
        GatewayError::Card(message)
    } else if status == 400 || kind == Some("invalid_request_error") {
        GatewayError::InvalidRequest(message)
    } else {
        GatewayError::Api { status, message }
    }
}

fn collection_fields(collection: CollectionMethod) -> Vec<(String, String)> {
    match collection {
        CollectionMethod::ChargeAutomatically => {
            vec![("collection_method".to_string(), "charge_automatically".to_string())]
        }
        CollectionMethod::SendInvoice { days_until_due } => vec![
            ("collection_method".to_string(), "send_invoice".to_string()),
            ("days_until_due".to_string(), days_until_due.to_string()),
        ],
    }
}

fn metadata_fields(metadata: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = metadata
        .iter()
        .map(|(k, v)| (format!("metadata[{}]", k), v.clone()))
        .collect();
    fields.sort();
    fields
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn create_customer(&self, email: Option<&str>, description: &str) -> GatewayResult<GatewayCustomer> {
        let mut form = vec![("description".to_string(), description.to_string())];
        if let Some(email) = email {
            form.push(("email".to_string(), email.to_string()));
        }
        let customer: StripeCustomer = self.post("customers", &form, "create customer").await?;
        debug!(customer_id = %customer.id, "Created billing customer");
        customer.into_customer()
    }

    async fn retrieve_customer(&self, customer_id: &str) -> GatewayResult<GatewayCustomer> {
        let customer: StripeCustomer = self
            .get(
                &format!("customers/{}?expand[]=default_source", customer_id),
                "retrieve customer",
            )
            .await?;
        customer.into_customer()
    }

    async fn update_customer(&self, customer_id: &str, update: &CustomerUpdate) -> GatewayResult<GatewayCustomer> {
        let mut form = vec![("expand[]".to_string(), "default_source".to_string())];
        if let Some(email) = &update.email {
            form.push(("email".to_string(), email.clone()));
        }
        if let Some(source) = &update.source {
            form.push(("source".to_string(), source.clone()));
        }
        let customer: StripeCustomer = self
            .post(&format!("customers/{}", customer_id), &form, "update customer")
            .await?;
        customer.into_customer()
    }

    async fn create_subscription(&self, request: &SubscriptionRequest) -> GatewayResult<GatewaySubscription> {
        let mut form = vec![
            ("customer".to_string(), request.customer_id.clone()),
            ("items[0][plan]".to_string(), request.price_id.clone()),
            ("items[0][quantity]".to_string(), request.quantity.to_string()),
        ];
        form.extend(collection_fields(request.collection));
        form.extend(metadata_fields(&request.metadata));

        self.post("subscriptions", &form, "create subscription").await
    }

    async fn modify_subscription(
        &self,
        subscription_id: &str,
        change: &SubscriptionChange,
    ) -> GatewayResult<GatewaySubscription> {
        let current: GatewaySubscription = self
            .get(&format!("subscriptions/{}", subscription_id), "retrieve subscription")
            .await?;
        let item = current
            .items
            .data
            .first()
            .ok_or_else(|| GatewayError::Decode(format!("subscription {} has no items", subscription_id)))?;

        let mut form = vec![
            (
                "cancel_at_period_end".to_string(),
                change.cancel_at_period_end.to_string(),
            ),
            ("items[0][id]".to_string(), item.id.clone()),
            ("items[0][plan]".to_string(), change.price_id.clone()),
            ("items[0][quantity]".to_string(), change.quantity.to_string()),
        ];
        form.extend(collection_fields(change.collection));
        self.post(
            &format!("subscriptions/{}", subscription_id),
            &form,
            "modify subscription",
        )
        .await
    }

    async fn cancel_subscription(&self, subscription_id: &str, at_period_end: bool) -> GatewayResult<()> {
        if at_period_end {
            let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
            let _: GatewaySubscription = self
                .post(
                    &format!("subscriptions/{}", subscription_id),
                    &form,
                    "cancel subscription at period end",
                )
                .await?;
            return Ok(());
        }

        let resp = self
            .http
            .delete(self.url(&format!("subscriptions/{}", subscription_id)))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .send()
            .await?;
        Self::ensure_success(resp, "delete subscription").await?;
        Ok(())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice> {
        self.get(&format!("invoices/{}", invoice_id), "retrieve invoice")
            .await
    }

    async fn modify_invoice(
        &self,
        invoice_id: &str,
        metadata: &HashMap<String, String>,
    ) -> GatewayResult<GatewayInvoice> {
        self.post(
            &format!("invoices/{}", invoice_id),
            &metadata_fields(metadata),
            "modify invoice",
        )
        .await
    }

    async fn mark_uncollectible(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice> {
        self.post(
            &format!("invoices/{}/mark_uncollectible", invoice_id),
            &[],
            "mark invoice uncollectible",
        )
        .await
    }

    async fn create_charge(&self, request: &ChargeRequest) -> GatewayResult<GatewayCharge> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), "usd".to_string()),
            ("description".to_string(), request.description.clone()),
        ];
        if let Some(customer) = &request.customer_id {
            form.push(("customer".to_string(), customer.clone()));
        }
        if let Some(source) = &request.source {
            form.push(("source".to_string(), source.clone()));
        }
        form.extend(metadata_fields(&request.metadata));

        self.post("charges", &form, "create charge").await
    }
}

/// Why a webhook payload was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("no matching signature")]
    Mismatch,
}

/// Verify a provider webhook signature header of the form `t=<ts>,v1=<hex>[,v1=<hex>]`.
///
/// The signed payload is `"{t}.{body}"`. Any configured secret may match.
/// A `tolerance_secs` of zero disables the timestamp window.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: Option<&str>,
    secrets: &[String],
    tolerance_secs: u64,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;

    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("t=") {
            timestamp = Some(rest);
        } else if let Some(rest) = part.strip_prefix("v1=") {
            if let Ok(bytes) = hex::decode(rest) {
                signatures.push(bytes);
            }
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let ts: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    if tolerance_secs > 0 && (now.timestamp() - ts).unsigned_abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);

    for secret in secrets {
        for signature in &signatures {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                continue;
            };
            mac.update(&signed);
            if mac.verify_slice(signature).is_ok() {
                return Ok(());
            }
        }
    }

    Err(SignatureError::Mismatch)
}

/// Produce a signature header for `payload`; used by tests and tooling
pub fn sign_webhook_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return format!("t={}", timestamp);
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
