//! Business logic services
//!
//! [`Services`] bundles the pool, configuration and outbound adapters. The
//! engines are cheap borrowed views over it; each public operation runs in
//! its own [`UnitOfWork`] and reports changed entities to the caller's
//! [`RequestContext`].

pub mod billing;
pub mod billing_gateway;
pub mod hooks;
pub mod invalidation;
pub mod invoices;
pub mod mailer;
pub mod membership;
pub mod organization;
pub mod roster_sync;
pub mod scheduler;
pub mod tasks;
pub mod webhook_events;

use std::sync::Arc;

use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{DbPool, OrganizationRepository, UserRepository};
use crate::models::{Organization, User};
use crate::utils::{AppError, AppResult};

pub use billing::{BillingEngine, ChargeOrder, CustomerCache, SubscriptionUpdate};
pub use billing_gateway::{BillingGateway, GatewayError, StripeGateway};
pub use hooks::{DomainEvent, Hooks, UnitOfWork};
pub use invalidation::{EntityKind, HttpInvalidationSender, InvalidationNotifier, InvalidationSender, RequestContext};
pub use invoices::{InvoiceEngine, OverdueAction};
pub use mailer::{Email, EmailTemplate, LogMailer, Mailer, Recipients, SmtpMailer};
pub use membership::MembershipEngine;
pub use organization::OrganizationCoordinator;
pub use roster_sync::{HttpRosterSync, NoopRosterSync, RosterSync};
pub use scheduler::{run_sweep, start_sweeps, Sweep};
pub use tasks::{Task, TaskQueue, TaskReceiver, TaskWorker};
pub use webhook_events::{BillingEvent, WebhookHandlers};

/// Shared state behind every engine
#[derive(Clone)]
pub struct Services {
    pub(crate) pool: DbPool,
    pub(crate) config: Arc<AppConfig>,
    pub(crate) gateway: Arc<dyn BillingGateway>,
    pub(crate) mailer: Arc<dyn Mailer>,
    pub(crate) invalidation_sender: Arc<dyn InvalidationSender>,
    pub(crate) roster: Arc<dyn RosterSync>,
    pub(crate) queue: TaskQueue,
    pub(crate) customers: CustomerCache,
    hooks: Arc<Hooks>,
}

impl Services {
    /// Wire services from explicit adapters; the receiver feeds a [`TaskWorker`]
    pub fn new(
        pool: DbPool,
        config: Arc<AppConfig>,
        gateway: Arc<dyn BillingGateway>,
        mailer: Arc<dyn Mailer>,
        invalidation_sender: Arc<dyn InvalidationSender>,
        roster: Arc<dyn RosterSync>,
    ) -> (Self, TaskReceiver) {
        let (queue, receiver) = TaskQueue::new();
        let hooks = Arc::new(Hooks::standard(queue.clone()));
        let services = Self {
            pool,
            config,
            gateway,
            mailer,
            invalidation_sender,
            roster,
            queue,
            customers: CustomerCache::default(),
            hooks,
        };
        (services, receiver)
    }

    /// Wire the production adapters described by `config`
    pub fn from_config(pool: DbPool, config: Arc<AppConfig>) -> anyhow::Result<(Self, TaskReceiver)> {
        let gateway: Arc<dyn BillingGateway> = Arc::new(StripeGateway::new(&config.billing)?);

        let mailer: Arc<dyn Mailer> = if config.email.enabled {
            info!(host = %config.email.smtp_host, "SMTP email delivery enabled");
            Arc::new(SmtpMailer::new(&config.email)?)
        } else {
            info!("Email disabled, messages will be logged");
            Arc::new(LogMailer)
        };

        let sender: Arc<dyn InvalidationSender> =
            Arc::new(HttpInvalidationSender::new(config.invalidation.timeout_secs)?);

        let roster: Arc<dyn RosterSync> = match &config.roster_sync {
            Some(roster_config) => Arc::new(HttpRosterSync::new(roster_config)?),
            None => Arc::new(NoopRosterSync),
        };

        Ok(Self::new(pool, config, gateway, mailer, sender, roster))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Start a transaction whose events reach the standard hooks on commit
    pub async fn begin(&self) -> AppResult<UnitOfWork> {
        UnitOfWork::begin(&self.pool, self.hooks.clone()).await
    }

    pub fn membership(&self) -> MembershipEngine<'_> {
        MembershipEngine::new(self)
    }

    pub fn billing(&self) -> BillingEngine<'_> {
        BillingEngine::new(self)
    }

    pub fn invoices(&self) -> InvoiceEngine<'_> {
        InvoiceEngine::new(self)
    }

    pub fn organizations(&self) -> OrganizationCoordinator<'_> {
        OrganizationCoordinator::new(self)
    }

    pub fn webhooks(&self) -> WebhookHandlers<'_> {
        WebhookHandlers::new(self)
    }

    pub fn notifier(&self) -> InvalidationNotifier<'_> {
        InvalidationNotifier::new(self)
    }

    pub fn enqueue(&self, task: Task) {
        self.queue.enqueue(task);
    }
}

pub(crate) async fn load_organization(conn: &mut SqliteConnection, id: Uuid) -> AppResult<Organization> {
    OrganizationRepository::new(conn)
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found("Organization", id))
}

pub(crate) async fn load_user(conn: &mut SqliteConnection, id: Uuid) -> AppResult<User> {
    UserRepository::new(conn)
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found("User", id))
}
