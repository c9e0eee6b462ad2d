//! Billing provider webhook events
//!
//! The HTTP endpoint only verifies and parses; handling happens on the task
//! queue. Every handler is keyed by the provider id of the object it touches
//! so redelivered events never duplicate local rows.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::{
    ChargeRepository, InvoiceRepository, NewCharge, OrganizationRepository, PlanRepository, SubscriptionRepository,
};
use crate::models::{slug_from_price_id, InvoiceStatus, Organization};
use crate::services::billing::receipt_email;
use crate::services::billing_gateway::{GatewayCharge, GatewayInvoice};
use crate::services::hooks::{DomainEvent, UnitOfWork};
use crate::services::invalidation::RequestContext;
use crate::services::invoices::upsert_gateway_invoice;
use crate::services::mailer::{Email, EmailTemplate, Recipients};
use crate::services::Services;
use crate::utils::{AppError, AppResult};

/// Payment attempt after which the provider gives up on an invoice
pub const FINAL_PAYMENT_ATTEMPT: i64 = 4;

const BENIGN_PLAN_PREFIXES: [&str; 2] = ["donate", "crowdfund"];
const BENIGN_CHARGE_ACTIONS: [&str; 2] = ["donation", "crowdfund-payment"];

/// A webhook event this service acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum BillingEvent {
    #[serde(rename = "charge.succeeded")]
    ChargeSucceeded(GatewayCharge),
    #[serde(rename = "invoice.created")]
    InvoiceCreated(GatewayInvoice),
    #[serde(rename = "invoice.finalized")]
    InvoiceFinalized(GatewayInvoice),
    #[serde(rename = "invoice.paid")]
    InvoicePaid(GatewayInvoice),
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed(GatewayInvoice),
    #[serde(rename = "invoice.marked_uncollectible")]
    InvoiceMarkedUncollectible(GatewayInvoice),
    #[serde(rename = "invoice.voided")]
    InvoiceVoided(GatewayInvoice),
}

impl BillingEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::ChargeSucceeded(_) => "charge.succeeded",
            BillingEvent::InvoiceCreated(_) => "invoice.created",
            BillingEvent::InvoiceFinalized(_) => "invoice.finalized",
            BillingEvent::InvoicePaid(_) => "invoice.paid",
            BillingEvent::InvoicePaymentFailed(_) => "invoice.payment_failed",
            BillingEvent::InvoiceMarkedUncollectible(_) => "invoice.marked_uncollectible",
            BillingEvent::InvoiceVoided(_) => "invoice.voided",
        }
    }

    /// Provider id of the object the event is about
    pub fn object_id(&self) -> &str {
        match self {
            BillingEvent::ChargeSucceeded(charge) => &charge.id,
            BillingEvent::InvoiceCreated(invoice)
            | BillingEvent::InvoiceFinalized(invoice)
            | BillingEvent::InvoicePaid(invoice)
            | BillingEvent::InvoicePaymentFailed(invoice)
            | BillingEvent::InvoiceMarkedUncollectible(invoice)
            | BillingEvent::InvoiceVoided(invoice) => &invoice.id,
        }
    }
}

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("event has no type")]
    MissingType,

    #[error("malformed {event_type} object: {reason}")]
    InvalidObject { event_type: String, reason: String },
}

/// Parse a webhook envelope `{type, data: {object}}`.
///
/// Event types this service does not handle parse to `None`.
pub fn parse_event(payload: &[u8]) -> Result<Option<BillingEvent>, EventParseError> {
    let envelope: Value = serde_json::from_slice(payload)?;
    let event_type = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EventParseError::MissingType)?;

    let handled = matches!(
        event_type,
        "charge.succeeded"
            | "invoice.created"
            | "invoice.finalized"
            | "invoice.paid"
            | "invoice.payment_failed"
            | "invoice.marked_uncollectible"
            | "invoice.voided"
    );
    if !handled {
        return Ok(None);
    }

    let object = envelope
        .pointer("/data/object")
        .cloned()
        .ok_or_else(|| EventParseError::InvalidObject {
            event_type: event_type.to_string(),
            reason: "missing data.object".to_string(),
        })?;

    serde_json::from_value(json!({ "type": event_type, "object": object }))
        .map(Some)
        .map_err(|e| EventParseError::InvalidObject {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })
}

fn is_benign_plan(plan_id: &str) -> bool {
    let plan_id = plan_id.to_lowercase();
    BENIGN_PLAN_PREFIXES.iter().any(|prefix| plan_id.starts_with(prefix))
}

fn is_benign_charge(charge: &GatewayCharge) -> bool {
    charge
        .metadata
        .get("action")
        .is_some_and(|action| BENIGN_CHARGE_ACTIONS.contains(&action.to_lowercase().as_str()))
}

pub struct WebhookHandlers<'a> {
    services: &'a Services,
}

impl<'a> WebhookHandlers<'a> {
    pub(crate) fn new(services: &'a Services) -> Self {
        Self { services }
    }

    pub async fn handle(&self, ctx: &mut RequestContext, event: &BillingEvent) -> AppResult<()> {
        debug!(event_type = event.event_type(), object_id = event.object_id(), "Handling billing event");
        match event {
            BillingEvent::ChargeSucceeded(charge) => self.charge_succeeded(ctx, charge).await,
            BillingEvent::InvoiceCreated(invoice) => self.invoice_created(ctx, invoice).await,
            BillingEvent::InvoiceFinalized(invoice) => {
                self.invoice_status(ctx, invoice, invoice.invoice_status(), invoice.due_on())
                    .await
            }
            BillingEvent::InvoicePaid(invoice) => self.invoice_paid(ctx, invoice).await,
            BillingEvent::InvoicePaymentFailed(invoice) => self.invoice_failed(ctx, invoice).await,
            BillingEvent::InvoiceMarkedUncollectible(invoice) => {
                self.invoice_status(ctx, invoice, InvoiceStatus::Uncollectible, None)
                    .await
            }
            BillingEvent::InvoiceVoided(invoice) => {
                self.invoice_status(ctx, invoice, InvoiceStatus::Void, None).await
            }
        }
    }

    /// The organization owning `customer_id`.
    ///
    /// The customer id may not be recorded yet when the provider is quick to
    /// call back, so a miss is reported as retryable.
    async fn organization_for_customer(&self, uow: &mut UnitOfWork, customer_id: &str) -> AppResult<Organization> {
        OrganizationRepository::new(uow.conn())
            .find_by_customer_id(customer_id)
            .await?
            .ok_or_else(|| AppError::ServiceUnavailable(format!("No organization for customer {}", customer_id)))
    }

    async fn plan_name(&self, uow: &mut UnitOfWork, price_id: &str) -> AppResult<String> {
        let Some(slug) = slug_from_price_id(price_id) else {
            return Ok(price_id.to_string());
        };
        Ok(PlanRepository::new(uow.conn())
            .get_by_slug(slug)
            .await?
            .map(|plan| plan.name)
            .unwrap_or_else(|| slug.to_string()))
    }

    async fn charge_succeeded(&self, ctx: &mut RequestContext, charge: &GatewayCharge) -> AppResult<()> {
        // Anonymous donations and crowdfunds carry no customer
        let Some(customer_id) = &charge.customer else {
            return Ok(());
        };

        let invoice = match &charge.invoice {
            Some(invoice_id) => Some(self.services.gateway.retrieve_invoice(invoice_id).await?),
            None => None,
        };
        let plan_id = invoice.as_ref().and_then(|i| i.plan_id()).map(str::to_string);
        if plan_id.as_deref().is_some_and(is_benign_plan) || (invoice.is_none() && is_benign_charge(charge)) {
            debug!(charge_id = %charge.id, "Skipping donation charge");
            return Ok(());
        }

        let mut uow = self.services.begin().await?;
        let org = self.organization_for_customer(&mut uow, customer_id).await?;

        let mut metadata = charge.metadata.clone();
        let description = match (&invoice, &plan_id) {
            (Some(_), Some(plan_id)) => {
                let plan_name = self.plan_name(&mut uow, plan_id).await?;
                metadata.insert("plan".to_string(), plan_name.clone());
                metadata.insert("action".to_string(), "Subscription Payment".to_string());
                format!("Subscription Payment for {} plan", plan_name)
            }
            _ => charge.description.clone().unwrap_or_default(),
        };
        let fee_amount = charge
            .metadata
            .get("fee amount")
            .and_then(|fee| fee.parse().ok())
            .unwrap_or(0);

        let (stored, created) = ChargeRepository::new(uow.conn())
            .get_or_create(&NewCharge {
                charge_id: charge.id.clone(),
                organization_id: org.id,
                amount: charge.amount,
                fee_amount,
                description,
                metadata,
                created_at: charge.created_at(),
            })
            .await?;
        if created {
            uow.email(receipt_email(&org, &stored));
        }
        uow.commit(ctx).await?;

        info!(
            organization_id = %org.id,
            charge_id = %charge.id,
            amount = charge.amount,
            new_charge = created,
            "Recorded charge"
        );
        Ok(())
    }

    async fn invoice_created(&self, ctx: &mut RequestContext, invoice: &GatewayInvoice) -> AppResult<()> {
        let Some(customer_id) = &invoice.customer else {
            warn!(invoice_id = %invoice.id, "Invoice without customer");
            return Ok(());
        };
        let mut uow = self.services.begin().await?;
        let org = match self.organization_for_customer(&mut uow, customer_id).await {
            Ok(org) => org,
            Err(_) if invoice.plan_id().is_some_and(is_benign_plan) => return Ok(()),
            Err(err) => return Err(err),
        };

        let subscription_id = match invoice.subscription_id() {
            Some(external) => SubscriptionRepository::new(uow.conn())
                .find_by_external_id(org.id, external)
                .await?
                .map(|s| s.id),
            None => None,
        };
        upsert_gateway_invoice(uow.conn(), invoice, org.id, subscription_id).await?;
        uow.commit(ctx).await?;

        info!(
            organization_id = %org.id,
            invoice_id = %invoice.id,
            amount = invoice.amount_due,
            "Recorded invoice"
        );
        Ok(())
    }

    async fn invoice_status(
        &self,
        ctx: &mut RequestContext,
        invoice: &GatewayInvoice,
        status: InvoiceStatus,
        due_date: Option<chrono::NaiveDate>,
    ) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let updated = InvoiceRepository::new(uow.conn())
            .set_status(&invoice.id, status, due_date)
            .await?;
        uow.commit(ctx).await?;

        if updated {
            info!(invoice_id = %invoice.id, status = %status, "Invoice status updated");
        } else {
            debug!(invoice_id = %invoice.id, "Status change for unknown invoice");
        }
        Ok(())
    }

    async fn invoice_paid(&self, ctx: &mut RequestContext, invoice: &GatewayInvoice) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let mut invoices = InvoiceRepository::new(uow.conn());
        invoices.set_status(&invoice.id, InvoiceStatus::Paid, None).await?;
        let Some(stored) = invoices.get_by_invoice_id(&invoice.id).await? else {
            debug!(invoice_id = %invoice.id, "Payment for unknown invoice");
            uow.commit(ctx).await?;
            return Ok(());
        };

        let mut orgs = OrganizationRepository::new(uow.conn());
        if orgs.get(stored.organization_id).await?.is_some_and(|org| org.payment_failed) {
            orgs.set_payment_failed(stored.organization_id, false).await?;
            uow.raise(DomainEvent::OrganizationChanged(stored.organization_id));
        }
        uow.commit(ctx).await?;

        info!(organization_id = %stored.organization_id, invoice_id = %invoice.id, "Invoice paid");
        Ok(())
    }

    async fn invoice_failed(&self, ctx: &mut RequestContext, invoice: &GatewayInvoice) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let org = match &invoice.customer {
            Some(customer_id) => OrganizationRepository::new(uow.conn())
                .find_by_customer_id(customer_id)
                .await?,
            None => None,
        };
        let Some(org) = org else {
            if !invoice.plan_id().is_some_and(is_benign_plan) {
                error!(
                    invoice_id = %invoice.id,
                    customer_id = ?invoice.customer,
                    "Invoice failed for customer with no matching organization"
                );
            }
            return Ok(());
        };

        OrganizationRepository::new(uow.conn())
            .set_payment_failed(org.id, true)
            .await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));

        let final_attempt = invoice.attempt_count == FINAL_PAYMENT_ATTEMPT;
        let subject = if final_attempt {
            self.services.billing().subscription_cancelled(&mut uow, &org).await?;
            "Your subscription has been cancelled"
        } else {
            "Your payment has failed"
        };
        let attempt = if final_attempt {
            json!("final")
        } else {
            json!(invoice.attempt_count)
        };
        uow.email(Email::new(
            EmailTemplate::PaymentFailed,
            subject,
            Recipients::OrganizationAdmins(org.id),
            json!({ "organization": org.name, "invoice": invoice.id, "attempt": attempt }),
        ));
        uow.commit(ctx).await?;

        info!(
            organization_id = %org.id,
            invoice_id = %invoice.id,
            attempt = invoice.attempt_count,
            "Invoice payment failed"
        );
        Ok(())
    }
}
