//! Subscription and billing engine
//!
//! Local subscription state lives in the ledger; the payment provider holds
//! customers, subscriptions and charges. Provider calls made on behalf of a
//! request block that request and surface their errors to it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{Months, NaiveDate, Utc};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{
    ChangeLogRepository, ChargeRepository, CustomerRepository, MembershipRepository, NewChangeLog, NewCharge,
    OrganizationRepository, PlanRepository, ReceiptEmailRepository, SubscriptionRepository, UserRepository,
};
use crate::models::{ChangeLogReason, Charge, Organization, PaymentMethod, Plan, Subscription};
use crate::services::billing_gateway::{
    ChargeRequest, CollectionMethod, CustomerUpdate, GatewayCustomer, SubscriptionChange, SubscriptionRequest,
};
use crate::services::hooks::{DomainEvent, UnitOfWork};
use crate::services::invalidation::RequestContext;
use crate::services::invoices::upsert_gateway_invoice;
use crate::services::mailer::{Email, EmailTemplate, Recipients};
use crate::services::{load_organization, Services};
use crate::utils::{AppError, AppResult};

const CUSTOMER_CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    customer: GatewayCustomer,
    expires_at: Instant,
}

/// Short-lived cache of provider customers, keyed by organization
#[derive(Clone)]
pub struct CustomerCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<Uuid, CacheEntry>>>,
}

impl Default for CustomerCache {
    fn default() -> Self {
        Self::with_ttl(CUSTOMER_CACHE_TTL)
    }
}

impl CustomerCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, organization_id: Uuid) -> Option<GatewayCustomer> {
        let entries = self.entries.read().ok()?;
        entries
            .get(&organization_id)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.customer.clone())
    }

    pub fn put(&self, organization_id: Uuid, customer: GatewayCustomer) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                organization_id,
                CacheEntry {
                    customer,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }

    pub fn invalidate(&self, organization_id: Uuid) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&organization_id);
        }
    }
}

/// Address used for billing: the owner of an individual organization, else
/// the first receipt address, else the first admin
pub(crate) async fn organization_email(conn: &mut SqliteConnection, org: &Organization) -> AppResult<Option<String>> {
    if org.individual {
        let user = UserRepository::new(conn).get(org.id).await?;
        return Ok(user.and_then(|u| u.email));
    }
    if let Some(email) = ReceiptEmailRepository::new(conn).list(org.id).await?.into_iter().next() {
        return Ok(Some(email));
    }
    Ok(MembershipRepository::new(conn)
        .admin_emails(org.id)
        .await?
        .into_iter()
        .next())
}

pub(crate) fn receipt_email(org: &Organization, charge: &Charge) -> Email {
    Email::new(
        EmailTemplate::Receipt,
        "Receipt",
        Recipients::OrganizationReceipts(org.id),
        json!({
            "organization": org.name,
            "charge": charge.charge_id,
            "amount": charge.amount,
            "description": charge.description,
            "items": charge.items(),
        }),
    )
}

/// Requested plan and capacity for [`BillingEngine::set_subscription`]
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub plan_id: Option<Uuid>,
    pub max_users: i64,
    /// Card token to save as the default source
    pub token: Option<String>,
    pub actor_id: Option<Uuid>,
    pub payment_method: Option<PaymentMethod>,
}

/// One-off charge for [`BillingEngine::charge`]
#[derive(Debug, Clone, Default)]
pub struct ChargeOrder {
    pub amount: i64,
    pub description: String,
    /// Processing fee as a percentage of the base amount
    pub fee_amount: i64,
    pub token: Option<String>,
    pub save_card: bool,
    pub metadata: HashMap<String, String>,
}

pub struct BillingEngine<'a> {
    services: &'a Services,
}

impl<'a> BillingEngine<'a> {
    pub(crate) fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// The organization's provider customer, created or repaired as needed.
    ///
    /// The customer row is locked for the whole check-and-create so that
    /// concurrent callers never create two provider customers.
    pub async fn ensure_customer(&self, org: &Organization) -> AppResult<GatewayCustomer> {
        if let Some(customer) = self.services.customers.get(org.id) {
            return Ok(customer);
        }

        let gateway = &self.services.gateway;
        let mut tx = self.services.pool.begin().await?;
        let local = CustomerRepository::new(&mut tx).lock(org.id).await?;

        if let Some(customer_id) = &local.customer_id {
            match gateway.retrieve_customer(customer_id).await {
                Ok(customer) => {
                    tx.commit().await?;
                    self.services.customers.put(org.id, customer.clone());
                    return Ok(customer);
                }
                Err(err) if err.is_resource_missing() => {
                    warn!(
                        organization_id = %org.id,
                        customer_id = %customer_id,
                        "Stored billing customer is gone, recreating"
                    );
                    self.services.customers.invalidate(org.id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let email = organization_email(&mut tx, org).await?;
        let customer = gateway.create_customer(email.as_deref(), &org.name).await?;
        CustomerRepository::new(&mut tx)
            .set_customer_id(org.id, Some(&customer.id))
            .await?;
        tx.commit().await?;

        info!(organization_id = %org.id, customer_id = %customer.id, "Created billing customer");
        self.services.customers.put(org.id, customer.clone());
        Ok(customer)
    }

    /// Make `token` the organization's default card
    pub async fn save_card(&self, org: &Organization, token: &str) -> AppResult<GatewayCustomer> {
        let customer = self.ensure_customer(org).await?;
        let update = CustomerUpdate {
            source: Some(token.to_string()),
            ..Default::default()
        };
        let updated = self.services.gateway.update_customer(&customer.id, &update).await?;
        self.services.customers.put(org.id, updated.clone());
        Ok(updated)
    }

    fn collection(&self, plan: &Plan, method: PaymentMethod) -> CollectionMethod {
        if plan.annual && method == PaymentMethod::Invoice {
            CollectionMethod::SendInvoice {
                days_until_due: self.services.config.billing.invoice_days_until_due,
            }
        } else {
            CollectionMethod::ChargeAutomatically
        }
    }

    /// Move the organization to `update.plan_id` with `update.max_users` seats.
    ///
    /// Local changes commit together with the change log only if every
    /// provider call succeeds. A card saved from `update.token` stays saved.
    pub async fn set_subscription(
        &self,
        ctx: &mut RequestContext,
        organization_id: Uuid,
        update: SubscriptionUpdate,
    ) -> AppResult<()> {
        let mut conn = self.services.pool.acquire().await?;
        let org = load_organization(&mut conn, organization_id).await?;
        if org.is_merged() {
            return Err(AppError::validation(format!("{} has been merged", org.name)));
        }
        let max_users = if org.individual { 1 } else { update.max_users };
        if max_users < 1 {
            return Err(AppError::validation("An organization needs at least one seat"));
        }

        let target = match update.plan_id {
            Some(plan_id) => Some(
                PlanRepository::new(&mut conn)
                    .get(plan_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("Plan", plan_id))?,
            ),
            None => None,
        };
        let current = SubscriptionRepository::new(&mut conn)
            .current_for_organization(org.id)
            .await?;

        if let Some(plan) = &target {
            let granted = PlanRepository::new(&mut conn).is_granted(plan.id, org.id).await?;
            if !plan.available_to(&org, granted) {
                return Err(AppError::validation(format!("The {} plan is not available", plan.name)));
            }
            let joining = current.as_ref().is_none_or(|s| s.plan_id != plan.id || s.cancelled);
            if let (Some(family), Some(cap), true) = (&plan.family, plan.family_subscription_cap, joining) {
                if PlanRepository::new(&mut conn).count_family_subscriptions(family).await? >= cap {
                    return Err(AppError::validation(format!(
                        "There are no more slots available for the {} plan",
                        plan.name
                    )));
                }
            }
        }
        drop(conn);

        // Provider customer and card first; neither can be undone by a rollback
        let mut customer_id = None;
        let mut method = PaymentMethod::Card;
        if let Some(plan) = target.as_ref().filter(|p| !p.is_free()) {
            let customer = match &update.token {
                Some(token) => self.save_card(&org, token).await?,
                None => self.ensure_customer(&org).await?,
            };
            method = PaymentMethod::resolve(update.payment_method, customer.card.is_some());
            if method == PaymentMethod::Invoice && !plan.annual {
                method = PaymentMethod::Card;
            }
            customer_id = Some(customer.id);
        }

        // A cancelled row stays current until the restore sweep removes it,
        // so plan changes before then modify it in place
        let mut uow = self.services.begin().await?;
        let current = SubscriptionRepository::new(uow.conn())
            .current_for_organization(org.id)
            .await?;
        let from_plan = current.as_ref().map(|s| s.plan_id);

        OrganizationRepository::new(uow.conn())
            .set_max_users(org.id, max_users)
            .await?;

        match (current, &target) {
            (None, Some(plan)) => {
                let mut subscription = SubscriptionRepository::new(uow.conn())
                    .create(org.id, plan.id, next_restore_date(Utc::now().date_naive()))
                    .await?;
                self.start(&mut uow, &mut subscription, plan, max_users, customer_id.as_deref(), method)
                    .await?;
            }
            (Some(subscription), None) if subscription.cancelled => {
                debug!(subscription_id = %subscription.id, "Subscription already cancelled");
            }
            (Some(mut subscription), None) => {
                self.cancel(&mut uow, &mut subscription).await?;
            }
            (Some(mut subscription), Some(plan)) => {
                self.modify(&mut uow, &mut subscription, plan, max_users, customer_id.as_deref(), method)
                    .await?;
            }
            (None, None) => {}
        }

        ChangeLogRepository::new(uow.conn())
            .create(&NewChangeLog {
                organization_id: org.id,
                user_id: update.actor_id,
                reason: ChangeLogReason::Updated,
                from_plan_id: from_plan,
                to_plan_id: target.as_ref().map(|p| p.id),
                from_max_users: Some(org.max_users),
                to_max_users: Some(max_users),
            })
            .await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));
        uow.commit(ctx).await?;

        info!(
            organization_id = %org.id,
            from_plan = ?from_plan,
            to_plan = ?target.as_ref().map(|p| p.slug.as_str()),
            max_users,
            payment_method = %method,
            "Subscription updated"
        );
        Ok(())
    }

    /// Create the provider subscription for a local row.
    ///
    /// A row that already has one is left alone; free plans never get one.
    /// The first invoice is mirrored on a best-effort basis.
    async fn start(
        &self,
        uow: &mut UnitOfWork,
        subscription: &mut Subscription,
        plan: &Plan,
        quantity: i64,
        customer_id: Option<&str>,
        method: PaymentMethod,
    ) -> AppResult<()> {
        if let Some(existing) = &subscription.subscription_id {
            error!(
                subscription_id = %subscription.id,
                external_id = %existing,
                "Trying to start an existing subscription"
            );
            return Ok(());
        }
        if plan.is_free() {
            return Ok(());
        }
        let customer_id =
            customer_id.ok_or_else(|| AppError::Internal("No billing customer for paid plan".to_string()))?;

        let created = self
            .services
            .gateway
            .create_subscription(&SubscriptionRequest {
                customer_id: customer_id.to_string(),
                price_id: plan.price_id(),
                quantity,
                collection: self.collection(plan, method),
                metadata: HashMap::from([("organization".to_string(), subscription.organization_id.to_string())]),
            })
            .await?;

        subscription.subscription_id = Some(created.id.clone());
        subscription.cancelled = false;
        SubscriptionRepository::new(uow.conn()).save(subscription).await?;

        if let Some(invoice_id) = &created.latest_invoice {
            match self.services.gateway.retrieve_invoice(invoice_id).await {
                Ok(invoice) => {
                    if let Err(err) =
                        upsert_gateway_invoice(uow.conn(), &invoice, subscription.organization_id, Some(subscription.id))
                            .await
                    {
                        warn!(invoice_id = %invoice_id, error = %err, "Failed to record first invoice");
                    }
                }
                Err(err) => {
                    warn!(invoice_id = %invoice_id, error = %err, "Failed to fetch first invoice");
                }
            }
        }

        debug!(subscription_id = %subscription.id, external_id = %created.id, "Subscription started");
        Ok(())
    }

    /// Flag for removal and let the provider run out the paid period
    async fn cancel(&self, uow: &mut UnitOfWork, subscription: &mut Subscription) -> AppResult<()> {
        if let Some(external) = &subscription.subscription_id {
            self.services.gateway.cancel_subscription(external, true).await?;
        }
        subscription.cancelled = true;
        SubscriptionRepository::new(uow.conn()).save(subscription).await?;
        Ok(())
    }

    async fn modify(
        &self,
        uow: &mut UnitOfWork,
        subscription: &mut Subscription,
        plan: &Plan,
        quantity: i64,
        customer_id: Option<&str>,
        method: PaymentMethod,
    ) -> AppResult<()> {
        let old_plan = PlanRepository::new(uow.conn())
            .get(subscription.plan_id)
            .await?
            .ok_or_else(|| AppError::not_found("Plan", subscription.plan_id))?;

        subscription.plan_id = plan.id;
        subscription.cancelled = false;

        match (old_plan.is_free(), plan.is_free()) {
            (true, false) => {
                self.start(uow, subscription, plan, quantity, customer_id, method).await?;
            }
            (false, true) => {
                if let Some(external) = subscription.subscription_id.take() {
                    self.services.gateway.cancel_subscription(&external, false).await?;
                }
            }
            (false, false) => match &subscription.subscription_id {
                Some(external) => {
                    self.services
                        .gateway
                        .modify_subscription(
                            external,
                            &SubscriptionChange {
                                price_id: plan.price_id(),
                                quantity,
                                collection: self.collection(plan, method),
                                cancel_at_period_end: false,
                            },
                        )
                        .await?;
                }
                None => {
                    self.start(uow, subscription, plan, quantity, customer_id, method).await?;
                }
            },
            (true, true) => {}
        }

        SubscriptionRepository::new(uow.conn()).save(subscription).await?;
        Ok(())
    }

    /// The provider gave up on payment: log it, end the provider
    /// subscription now and drop the local row.
    pub(crate) async fn subscription_cancelled(&self, uow: &mut UnitOfWork, org: &Organization) -> AppResult<()> {
        let subscription = SubscriptionRepository::new(uow.conn())
            .current_for_organization(org.id)
            .await?;

        ChangeLogRepository::new(uow.conn())
            .create(&NewChangeLog {
                organization_id: org.id,
                user_id: None,
                reason: ChangeLogReason::Failed,
                from_plan_id: subscription.as_ref().map(|s| s.plan_id),
                to_plan_id: None,
                from_max_users: Some(org.max_users),
                to_max_users: Some(org.max_users),
            })
            .await?;

        let Some(subscription) = subscription else {
            warn!(organization_id = %org.id, "Cancelling for non-payment without a subscription");
            return Ok(());
        };

        if let Some(external) = &subscription.subscription_id {
            if let Err(err) = self.services.gateway.cancel_subscription(external, false).await {
                error!(
                    organization_id = %org.id,
                    external_id = %external,
                    error = %err,
                    "Failed to cancel provider subscription"
                );
            }
        }
        SubscriptionRepository::new(uow.conn()).delete(subscription.id).await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));

        info!(organization_id = %org.id, "Subscription cancelled for non-payment");
        Ok(())
    }

    /// Monthly resource restore: drop cancelled subscriptions whose period
    /// has ended and push the rest to next month
    pub async fn restore_subscriptions(&self, ctx: &mut RequestContext, today: NaiveDate) -> AppResult<usize> {
        let mut uow = self.services.begin().await?;
        let due = SubscriptionRepository::new(uow.conn()).list_due(today).await?;
        let next = next_restore_date(today);

        let mut organizations = Vec::with_capacity(due.len());
        for mut subscription in due {
            organizations.push(subscription.organization_id);
            if subscription.cancelled {
                SubscriptionRepository::new(uow.conn()).delete(subscription.id).await?;
            } else {
                subscription.update_on = next;
                SubscriptionRepository::new(uow.conn()).save(&subscription).await?;
            }
        }

        let count = organizations.len();
        if count > 0 {
            uow.raise(DomainEvent::OrganizationsChanged(organizations));
        }
        uow.commit(ctx).await?;

        info!(count, "Restored organization subscriptions");
        Ok(count)
    }

    /// Charge the organization once and record the charge
    pub async fn charge(&self, ctx: &mut RequestContext, organization_id: Uuid, order: ChargeOrder) -> AppResult<Charge> {
        let mut conn = self.services.pool.acquire().await?;
        let org = load_organization(&mut conn, organization_id).await?;
        drop(conn);

        let mut token = order.token.clone();
        if order.save_card {
            let token = token
                .take()
                .ok_or_else(|| AppError::validation("A card is required to save it"))?;
            self.save_card(&org, &token).await?;
        }

        let customer_id = match &token {
            Some(_) => None,
            None => Some(self.ensure_customer(&org).await?.id),
        };

        let mut metadata = order.metadata.clone();
        metadata.insert("fee amount".to_string(), order.fee_amount.to_string());

        let charged = self
            .services
            .gateway
            .create_charge(&ChargeRequest {
                customer_id,
                source: token,
                amount: order.amount,
                description: order.description.clone(),
                metadata: metadata.clone(),
            })
            .await?;

        let mut uow = self.services.begin().await?;
        let (charge, created) = ChargeRepository::new(uow.conn())
            .get_or_create(&NewCharge {
                charge_id: charged.id.clone(),
                organization_id: org.id,
                amount: order.amount,
                fee_amount: order.fee_amount,
                description: order.description,
                metadata,
                created_at: charged.created_at(),
            })
            .await?;
        if created {
            uow.email(receipt_email(&org, &charge));
        }
        uow.commit(ctx).await?;

        info!(organization_id = %org.id, charge_id = %charge.charge_id, amount = charge.amount, "Charged organization");
        Ok(charge)
    }
}

fn next_restore_date(from: NaiveDate) -> NaiveDate {
    from.checked_add_months(Months::new(1)).unwrap_or(from)
}
