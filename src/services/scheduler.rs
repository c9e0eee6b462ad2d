//! Periodic sweeps
//!
//! Two cron-driven jobs run in the background: the monthly resource
//! restore and the overdue invoice check. Each sweep runs in its own request
//! context so its invalidations flush once at the end.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::services::invalidation::RequestContext;
use crate::services::Services;
use crate::utils::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Drop ended subscriptions and roll the rest forward a month
    Restore,
    /// Queue processing for open invoices past their due date
    Overdue,
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sweep::Restore => write!(f, "restore"),
            Sweep::Overdue => write!(f, "overdue"),
        }
    }
}

/// Run one sweep now; returns how many items it touched
pub async fn run_sweep(services: &Services, sweep: Sweep, today: NaiveDate) -> AppResult<usize> {
    match sweep {
        Sweep::Restore => {
            let mut ctx = RequestContext::begin();
            match services.billing().restore_subscriptions(&mut ctx, today).await {
                Ok(count) => {
                    ctx.flush(&services.notifier()).await?;
                    Ok(count)
                }
                Err(err) => {
                    ctx.teardown();
                    Err(err)
                }
            }
        }
        Sweep::Overdue => services.invoices().check_overdue_invoices(today).await,
    }
}

/// Spawn one background loop per configured sweep
pub fn start_sweeps(services: Services, config: &ScheduleConfig) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    for (sweep, expr) in [(Sweep::Restore, &config.restore_cron), (Sweep::Overdue, &config.overdue_cron)] {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("Invalid {} cron expression '{}': {}", sweep, expr, e))?;
        let services = services.clone();
        handles.push(tokio::spawn(async move {
            sweep_loop(services, sweep, schedule).await;
        }));
        info!(sweep = %sweep, cron = %expr, next_run = ?calculate_next_run(expr), "Sweep scheduled");
    }
    Ok(handles)
}

async fn sweep_loop(services: Services, sweep: Sweep, schedule: Schedule) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(sweep = %sweep, "Schedule has no upcoming runs, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        debug!(sweep = %sweep, next_run = %next, "Waiting for next sweep");
        tokio::time::sleep(wait).await;

        let today = Utc::now().date_naive();
        match run_sweep(&services, sweep, today).await {
            Ok(count) => info!(sweep = %sweep, count, "Sweep finished"),
            Err(e) => error!(sweep = %sweep, error = %e, "Sweep failed"),
        }
    }
}

/// Calculate the next run time for a cron expression
pub fn calculate_next_run(cron_expr: &str) -> Option<DateTime<Utc>> {
    let schedule = match Schedule::from_str(cron_expr) {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid cron expression '{}': {}", cron_expr, e);
            return None;
        }
    };
    schedule.upcoming(Utc).next()
}

/// Validate a cron expression
pub fn validate_cron_expression(cron_expr: &str) -> Result<(), String> {
    Schedule::from_str(cron_expr)
        .map(|_| ())
        .map_err(|e| format!("Invalid cron expression: {}", e))
}
