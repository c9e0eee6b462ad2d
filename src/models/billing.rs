//! Billing records mirrored from the payment provider

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local half of the organization's billing-provider customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Provider customer id, absent until first created
    pub customer_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    /// Provider subscription id, absent for free plans
    pub subscription_id: Option<String>,
    /// Next monthly resource restore date
    pub update_on: NaiveDate,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

/// How a subscription is paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Invoice,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Invoice => "invoice",
        }
    }

    /// Pick the payment method for a subscription change.
    ///
    /// An explicit choice wins. Otherwise a card on file means card, and
    /// everything else is invoiced.
    pub fn resolve(explicit: Option<PaymentMethod>, has_card_on_file: bool) -> PaymentMethod {
        match explicit {
            Some(method) => method,
            None if has_card_on_file => PaymentMethod::Card,
            None => PaymentMethod::Invoice,
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "card" | "existing-card" | "new-card" => Ok(PaymentMethod::Card),
            "invoice" => Ok(PaymentMethod::Invoice),
            _ => Err(format!("Invalid payment method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Uncollectible => "uncollectible",
            InvoiceStatus::Void => "void",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(InvoiceStatus::Draft),
            "open" => Ok(InvoiceStatus::Open),
            "paid" => Ok(InvoiceStatus::Paid),
            "uncollectible" => Ok(InvoiceStatus::Uncollectible),
            "void" => Ok(InvoiceStatus::Void),
            _ => Err(format!("Invalid invoice status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    /// Provider invoice id
    pub invoice_id: String,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    /// Minor currency units
    pub amount: i64,
    pub due_date: Option<NaiveDate>,
    pub status: InvoiceStatus,
    pub last_overdue_email_sent: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Days past the due date, zero when not yet due or no due date is set
    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        self.due_date
            .map(|due| (today - due).num_days().max(0))
            .unwrap_or(0)
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == InvoiceStatus::Open && self.due_date.is_some_and(|due| due < today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: Uuid,
    /// Provider charge id
    pub charge_id: String,
    pub organization_id: Uuid,
    /// Minor currency units, fee included
    pub amount: i64,
    /// Processing fee as a percentage of the base amount
    pub fee_amount: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A receipt line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeItem {
    pub name: String,
    pub amount: i64,
}

impl Charge {
    /// Receipt lines, splitting out the processing fee when there is one
    pub fn items(&self) -> Vec<ChargeItem> {
        if self.fee_amount <= 0 {
            return vec![ChargeItem {
                name: self.description.clone(),
                amount: self.amount,
            }];
        }
        let base = self.amount * 100 / (100 + self.fee_amount);
        vec![
            ChargeItem {
                name: self.description.clone(),
                amount: base,
            },
            ChargeItem {
                name: "Processing Fee".to_string(),
                amount: self.amount - base,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLogReason {
    Created,
    Updated,
    Failed,
}

impl ChangeLogReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeLogReason::Created => "created",
            ChangeLogReason::Updated => "updated",
            ChangeLogReason::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ChangeLogReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeLogReason::Created),
            "updated" => Ok(ChangeLogReason::Updated),
            "failed" => Ok(ChangeLogReason::Failed),
            _ => Err(format!("Invalid change log reason: {}", s)),
        }
    }
}

/// Immutable audit record of a plan or capacity change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub reason: ChangeLogReason,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub from_max_users: Option<i64>,
    pub to_max_users: Option<i64>,
    pub created_at: DateTime<Utc>,
}
