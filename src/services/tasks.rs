//! Background task queue
//!
//! Side effects that talk to other systems run here, outside the request
//! that caused them: emails, cache invalidation delivery, roster sync,
//! per-invoice overdue processing and billing webhook events. Tasks are
//! retried with bounded exponential backoff when they fail transiently.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::db::{ClientRepository, UserRepository};
use crate::services::invalidation::{EntityKind, InvalidationPayload, RequestContext};
use crate::services::mailer::{resolve_recipients, Email, EmailError};
use crate::services::roster_sync::RosterTarget;
use crate::services::webhook_events::BillingEvent;
use crate::services::Services;
use crate::utils::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    SendInvalidation {
        client_id: Uuid,
        kind: EntityKind,
        uuids: Vec<Uuid>,
    },
    SendEmail(Box<Email>),
    RosterSync {
        organization_id: Uuid,
        plan_id: Uuid,
        user_id: Uuid,
    },
    ProcessOverdueInvoice {
        invoice_id: Uuid,
    },
    BillingEvent(Box<BillingEvent>),
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::SendInvalidation { .. } => "send_invalidation",
            Task::SendEmail(_) => "send_email",
            Task::RosterSync { .. } => "roster_sync",
            Task::ProcessOverdueInvoice { .. } => "process_overdue_invoice",
            Task::BillingEvent(_) => "billing_event",
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// Worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl From<AppError> for TaskError {
    fn from(err: AppError) -> Self {
        match &err {
            AppError::Gateway(gateway) if gateway.is_transient() => TaskError::Transient(err.to_string()),
            AppError::Database(_) | AppError::ServiceUnavailable(_) => TaskError::Transient(err.to_string()),
            _ => TaskError::Permanent(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Transient(format!("{:#}", err))
    }
}

pub type TaskReceiver = mpsc::UnboundedReceiver<Task>;

/// Sending half of the queue
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, task: Task) {
        let name = task.name();
        if self.sender.send(task).is_err() {
            error!(task = name, "Task queue closed, dropping task");
        }
    }
}

/// Delay before retry number `attempt` (zero based), without jitter
pub fn backoff_delay(config: &TaskConfig, attempt: u32) -> Duration {
    let delay = config
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.backoff_max_ms);
    Duration::from_millis(delay)
}

/// Run `task`, retrying transient failures
pub async fn run_with_retry(services: &Services, task: Task) {
    let config = &services.config.tasks;
    let mut attempt = 0;

    loop {
        match execute(services, &task).await {
            Ok(()) => {
                debug!(task = task.name(), attempt, "Task completed");
                return;
            }
            Err(TaskError::Transient(reason)) if attempt < config.max_retries => {
                let jitter = rand::thread_rng().gen_range(0..=config.backoff_base_ms);
                let delay = backoff_delay(config, attempt) + Duration::from_millis(jitter);
                warn!(
                    task = task.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Task failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(task = task.name(), attempt, error = %err, "Task failed, giving up");
                return;
            }
        }
    }
}

/// Run a task once
pub async fn execute(services: &Services, task: &Task) -> Result<(), TaskError> {
    match task {
        Task::SendInvalidation { client_id, kind, uuids } => {
            send_invalidation(services, *client_id, *kind, uuids).await
        }
        Task::SendEmail(email) => send_email(services, email).await,
        Task::RosterSync {
            organization_id,
            plan_id,
            user_id,
        } => {
            let target = RosterTarget {
                organization_id: *organization_id,
                plan_id: *plan_id,
            };
            roster_sync(services, &target, *user_id).await
        }
        Task::ProcessOverdueInvoice { invoice_id } => {
            let mut ctx = RequestContext::begin();
            let today = Utc::now().date_naive();
            match services.invoices().process_overdue_invoice(&mut ctx, *invoice_id, today).await {
                Ok(_) => {
                    ctx.flush(&services.notifier()).await?;
                    Ok(())
                }
                Err(err) => {
                    ctx.teardown();
                    Err(err.into())
                }
            }
        }
        Task::BillingEvent(event) => {
            let mut ctx = RequestContext::begin();
            match services.webhooks().handle(&mut ctx, event).await {
                Ok(()) => {
                    ctx.flush(&services.notifier()).await?;
                    Ok(())
                }
                Err(err) => {
                    ctx.teardown();
                    Err(err.into())
                }
            }
        }
    }
}

async fn send_invalidation(
    services: &Services,
    client_id: Uuid,
    kind: EntityKind,
    uuids: &[Uuid],
) -> Result<(), TaskError> {
    let mut conn = services.pool.acquire().await.map_err(AppError::from)?;
    let Some(client) = ClientRepository::new(&mut conn).get(client_id).await? else {
        debug!(client_id = %client_id, "Client removed, dropping invalidation");
        return Ok(());
    };
    drop(conn);

    let payload = InvalidationPayload::signed(&client.secret, kind, uuids.to_vec(), Utc::now().timestamp());
    services
        .invalidation_sender
        .send(&client, &payload)
        .await
        .map_err(|e| TaskError::Transient(format!("invalidation for {} failed: {}", client.name, e)))?;

    debug!(client = %client.name, kind = %kind, count = uuids.len(), "Sent cache invalidation");
    Ok(())
}

async fn send_email(services: &Services, email: &Email) -> Result<(), TaskError> {
    let mut conn = services.pool.acquire().await.map_err(AppError::from)?;
    let to = resolve_recipients(&mut conn, &email.recipients).await?;
    drop(conn);

    if to.is_empty() {
        warn!(template = ?email.template, "Email has no recipients, skipping");
        return Ok(());
    }

    match services.mailer.send(&to, email).await {
        Ok(()) => {
            info!(template = ?email.template, recipients = to.len(), "Email sent");
            Ok(())
        }
        Err(EmailError::SendFailed(reason)) => Err(TaskError::Transient(reason)),
        Err(err) => Err(TaskError::Permanent(err.to_string())),
    }
}

async fn roster_sync(services: &Services, target: &RosterTarget, user_id: Uuid) -> Result<(), TaskError> {
    let mut conn = services.pool.acquire().await.map_err(AppError::from)?;
    let Some(user) = UserRepository::new(&mut conn).get(user_id).await? else {
        return Err(TaskError::Permanent(format!("user {} not found", user_id)));
    };
    drop(conn);

    services.roster.sync_member(target, &user).await.map_err(|e| {
        if e.is_transient() {
            TaskError::Transient(e.to_string())
        } else {
            TaskError::Permanent(e.to_string())
        }
    })
}

/// Drains the queue, running each task concurrently
pub struct TaskWorker {
    services: Services,
    receiver: TaskReceiver,
}

impl TaskWorker {
    pub fn new(services: Services, receiver: TaskReceiver) -> Self {
        Self { services, receiver }
    }

    pub async fn run(mut self) {
        info!("Task worker started");
        while let Some(task) = self.receiver.recv().await {
            let services = self.services.clone();
            tokio::spawn(async move {
                run_with_retry(&services, task).await;
            });
        }
        info!("Task queue closed, worker stopping");
    }

    /// Run queued tasks one at a time until the queue is empty, including
    /// tasks enqueued while draining
    pub async fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            run_with_retry(&self.services, task).await;
            ran += 1;
        }
        ran
    }
}
