//! Invoice mirror and overdue processing
//!
//! Invoices are mirrored from the payment provider keyed by provider id. A
//! periodic sweep hands every open, past-due invoice to its own task so one
//! failing invoice never holds up the others.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OverdueConfig;
use crate::db::{InvoiceRepository, InvoiceUpsert, OrganizationRepository};
use crate::models::{Invoice, InvoiceStatus};
use crate::services::billing_gateway::GatewayInvoice;
use crate::services::hooks::{DomainEvent, UnitOfWork};
use crate::services::invalidation::RequestContext;
use crate::services::mailer::{Email, EmailTemplate, Recipients};
use crate::services::tasks::Task;
use crate::services::{load_organization, Services};
use crate::utils::AppResult;

/// Metadata flag written on invoices written off for non-payment
pub const MARKED_UNCOLLECTIBLE: &str = "marked_uncollectible";

/// Insert or refresh the local mirror of a provider invoice
pub(crate) async fn upsert_gateway_invoice(
    conn: &mut SqliteConnection,
    invoice: &GatewayInvoice,
    organization_id: Uuid,
    subscription_id: Option<Uuid>,
) -> AppResult<Invoice> {
    let stored = InvoiceRepository::new(conn)
        .upsert(&InvoiceUpsert {
            invoice_id: invoice.id.clone(),
            organization_id,
            subscription_id,
            amount: invoice.amount_due,
            due_date: invoice.due_on(),
            status: invoice.invoice_status(),
            created_at: invoice.created_at(),
        })
        .await?;
    Ok(stored)
}

/// What the overdue sweep does with one invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverdueAction {
    /// Paid, voided or not yet due
    Skip,
    /// Past the grace period: cancel and write off
    Cancel { days_overdue: i64 },
    /// Within the grace period, reminder due
    Remind {
        days_overdue: i64,
        days_until_cancellation: i64,
    },
    /// Within the grace period, reminder sent recently
    Flag { days_overdue: i64 },
}

/// Decide the overdue action for `invoice` on `today`
pub fn overdue_action(invoice: &Invoice, today: NaiveDate, config: &OverdueConfig) -> OverdueAction {
    if !invoice.is_overdue(today) {
        return OverdueAction::Skip;
    }
    let days_overdue = invoice.days_overdue(today);
    if days_overdue >= config.grace_period_days {
        return OverdueAction::Cancel { days_overdue };
    }

    let reminder_due = match invoice.last_overdue_email_sent {
        None => true,
        Some(sent) => (today - sent).num_days() >= config.reminder_interval_days(),
    };
    if reminder_due {
        OverdueAction::Remind {
            days_overdue,
            days_until_cancellation: config.grace_period_days - days_overdue,
        }
    } else {
        OverdueAction::Flag { days_overdue }
    }
}

pub struct InvoiceEngine<'a> {
    services: &'a Services,
}

impl<'a> InvoiceEngine<'a> {
    pub(crate) fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Queue one task per open, past-due invoice
    pub async fn check_overdue_invoices(&self, today: NaiveDate) -> AppResult<usize> {
        let mut conn = self.services.pool.acquire().await?;
        let overdue = InvoiceRepository::new(&mut conn).list_overdue(today).await?;
        drop(conn);

        for invoice in &overdue {
            self.services.queue.enqueue(Task::ProcessOverdueInvoice { invoice_id: invoice.id });
        }
        info!(count = overdue.len(), "Queued overdue invoices");
        Ok(overdue.len())
    }

    /// Apply the overdue policy to one invoice.
    ///
    /// Invoices that are no longer open are left alone, so reprocessing is
    /// harmless.
    pub async fn process_overdue_invoice(
        &self,
        ctx: &mut RequestContext,
        invoice_id: Uuid,
        today: NaiveDate,
    ) -> AppResult<OverdueAction> {
        let mut uow = self.services.begin().await?;
        let Some(invoice) = InvoiceRepository::new(uow.conn()).get(invoice_id).await? else {
            warn!(invoice_id = %invoice_id, "Overdue invoice no longer exists");
            return Ok(OverdueAction::Skip);
        };

        let action = overdue_action(&invoice, today, &self.services.config.overdue);
        let org = load_organization(uow.conn(), invoice.organization_id).await?;

        match action {
            OverdueAction::Skip => {
                debug!(invoice_id = %invoice.invoice_id, status = %invoice.status, "Invoice not overdue");
                return Ok(action);
            }
            OverdueAction::Cancel { days_overdue } => {
                self.services.billing().subscription_cancelled(&mut uow, &org).await?;

                let gateway = &self.services.gateway;
                let metadata = HashMap::from([(MARKED_UNCOLLECTIBLE.to_string(), "true".to_string())]);
                let written_off = match gateway.modify_invoice(&invoice.invoice_id, &metadata).await {
                    Ok(_) => gateway.mark_uncollectible(&invoice.invoice_id).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                match written_off {
                    Ok(()) => {
                        InvoiceRepository::new(uow.conn())
                            .set_status(&invoice.invoice_id, InvoiceStatus::Uncollectible, None)
                            .await?;
                    }
                    Err(err) => {
                        error!(
                            invoice_id = %invoice.invoice_id,
                            error = %err,
                            "Failed to mark invoice uncollectible"
                        );
                    }
                }

                uow.email(Email::new(
                    EmailTemplate::InvoiceCancelled,
                    "Your subscription has been cancelled",
                    Recipients::OrganizationAdmins(org.id),
                    json!({
                        "organization": org.name,
                        "invoice": invoice.invoice_id,
                        "amount": invoice.amount,
                        "days_overdue": days_overdue,
                    }),
                ));
                info!(
                    organization_id = %org.id,
                    invoice_id = %invoice.invoice_id,
                    days_overdue,
                    "Subscription cancelled for overdue invoice"
                );
            }
            OverdueAction::Remind {
                days_overdue,
                days_until_cancellation,
            } => {
                self.flag_payment_failed(&mut uow, org.id, org.payment_failed).await?;
                InvoiceRepository::new(uow.conn())
                    .set_last_overdue_email_sent(invoice.id, today)
                    .await?;
                uow.email(Email::new(
                    EmailTemplate::InvoiceOverdue,
                    "Your invoice is overdue",
                    Recipients::OrganizationAdmins(org.id),
                    json!({
                        "organization": org.name,
                        "invoice": invoice.invoice_id,
                        "amount": invoice.amount,
                        "days_overdue": days_overdue,
                        "days_until_cancellation": days_until_cancellation,
                    }),
                ));
                debug!(invoice_id = %invoice.invoice_id, days_overdue, "Sent overdue reminder");
            }
            OverdueAction::Flag { .. } => {
                self.flag_payment_failed(&mut uow, org.id, org.payment_failed).await?;
            }
        }

        uow.commit(ctx).await?;
        Ok(action)
    }

    async fn flag_payment_failed(
        &self,
        uow: &mut UnitOfWork,
        organization_id: Uuid,
        already_failed: bool,
    ) -> AppResult<()> {
        if already_failed {
            return Ok(());
        }
        OrganizationRepository::new(uow.conn())
            .set_payment_failed(organization_id, true)
            .await?;
        uow.raise(DomainEvent::OrganizationChanged(organization_id));
        Ok(())
    }
}
