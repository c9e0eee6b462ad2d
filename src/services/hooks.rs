//! Post-commit hooks
//!
//! Engines raise [`DomainEvent`]s on the [`UnitOfWork`] they are writing
//! through. Nothing observes an event until the transaction commits, at
//! which point each event is handed to every registered listener. Events of
//! a rolled-back unit are dropped with it.

use std::sync::Arc;

use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::db::DbPool;
use crate::services::invalidation::{EntityKind, RequestContext};
use crate::services::mailer::Email;
use crate::services::roster_sync::RosterTarget;
use crate::services::tasks::{Task, TaskQueue};
use crate::utils::AppResult;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    MembershipCreated {
        user_id: Uuid,
        organization_id: Uuid,
        roster_targets: Vec<RosterTarget>,
    },
    MembershipDeleted {
        user_id: Uuid,
        organization_id: Uuid,
    },
    UserChanged(Uuid),
    OrganizationChanged(Uuid),
    OrganizationsChanged(Vec<Uuid>),
    /// Email to send once the change is durable
    Email(Box<Email>),
}

/// Observer of committed domain events
pub trait EventListener: Send + Sync {
    fn on_commit(&self, event: &DomainEvent, ctx: &mut RequestContext);
}

/// Records changed users and organizations for cache invalidation
pub struct InvalidationListener;

impl EventListener for InvalidationListener {
    fn on_commit(&self, event: &DomainEvent, ctx: &mut RequestContext) {
        match event {
            DomainEvent::MembershipCreated { user_id, .. }
            | DomainEvent::MembershipDeleted { user_id, .. }
            | DomainEvent::UserChanged(user_id) => ctx.record(EntityKind::User, *user_id),
            DomainEvent::OrganizationChanged(id) => ctx.record(EntityKind::Organization, *id),
            DomainEvent::OrganizationsChanged(ids) => ctx.record_all(EntityKind::Organization, ids.iter().copied()),
            DomainEvent::Email(_) => {}
        }
    }
}

/// Queues roster sync jobs for new memberships
pub struct RosterSyncListener {
    queue: TaskQueue,
}

impl EventListener for RosterSyncListener {
    fn on_commit(&self, event: &DomainEvent, _ctx: &mut RequestContext) {
        if let DomainEvent::MembershipCreated {
            user_id,
            roster_targets,
            ..
        } = event
        {
            for target in roster_targets {
                self.queue.enqueue(Task::RosterSync {
                    organization_id: target.organization_id,
                    plan_id: target.plan_id,
                    user_id: *user_id,
                });
            }
        }
    }
}

/// Queues emails
pub struct MailListener {
    queue: TaskQueue,
}

impl EventListener for MailListener {
    fn on_commit(&self, event: &DomainEvent, _ctx: &mut RequestContext) {
        if let DomainEvent::Email(email) = event {
            self.queue.enqueue(Task::SendEmail(email.clone()));
        }
    }
}

/// The fixed listener set
pub struct Hooks {
    listeners: Vec<Box<dyn EventListener>>,
}

impl Hooks {
    pub fn standard(queue: TaskQueue) -> Self {
        Self {
            listeners: vec![
                Box::new(InvalidationListener),
                Box::new(RosterSyncListener { queue: queue.clone() }),
                Box::new(MailListener { queue }),
            ],
        }
    }

    pub fn dispatch(&self, event: &DomainEvent, ctx: &mut RequestContext) {
        for listener in &self.listeners {
            listener.on_commit(event, ctx);
        }
    }
}

/// A transaction plus the events raised inside it
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    events: Vec<DomainEvent>,
    hooks: Arc<Hooks>,
}

impl UnitOfWork {
    pub async fn begin(pool: &DbPool, hooks: Arc<Hooks>) -> AppResult<Self> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx,
            events: Vec::new(),
            hooks,
        })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub fn raise(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    pub fn email(&mut self, email: Email) {
        self.events.push(DomainEvent::Email(Box::new(email)));
    }

    /// Commit, then run the listeners for every raised event
    pub async fn commit(self, ctx: &mut RequestContext) -> AppResult<()> {
        self.tx.commit().await?;
        debug!(events = self.events.len(), "Unit of work committed");
        for event in &self.events {
            self.hooks.dispatch(event, ctx);
        }
        Ok(())
    }

    pub async fn rollback(self) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
