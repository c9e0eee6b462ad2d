//! Outbound email
//!
//! Emails are queued as [`crate::services::tasks::Task::SendEmail`] once the
//! triggering transaction commits. Recipients may be symbolic (an
//! organization's admins or its receipt addresses) and are resolved when the
//! task runs.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::EmailConfig;
use crate::db::{MembershipRepository, ReceiptEmailRepository};

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Failed to send email: {0}")]
    SendFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    JoinRequest,
    Invitation,
    Receipt,
    PaymentFailed,
    InvoiceOverdue,
    InvoiceCancelled,
    Verified,
    ChangeRequestTicket,
}

/// Who receives an email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipients {
    To(Vec<String>),
    OrganizationAdmins(Uuid),
    OrganizationReceipts(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub template: EmailTemplate,
    pub subject: String,
    pub recipients: Recipients,
    pub context: Value,
}

impl Email {
    pub fn new(template: EmailTemplate, subject: impl Into<String>, recipients: Recipients, context: Value) -> Self {
        Self {
            template,
            subject: subject.into(),
            recipients,
            context,
        }
    }

    fn field(&self, key: &str) -> String {
        match self.context.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Plain-text body
    pub fn render_body(&self) -> String {
        let org = self.field("organization");
        match self.template {
            EmailTemplate::JoinRequest => format!(
                "{} has requested to join {}.\n\nAccept or reject the request from the organization's member page.\n",
                self.field("user"),
                org
            ),
            EmailTemplate::Invitation => format!(
                "You have been invited to join {}.\n\nSign in with this address to accept the invitation.\n",
                org
            ),
            EmailTemplate::Receipt => {
                let mut body = format!("Receipt for {}\n\n", org);
                if let Some(Value::Array(items)) = self.context.get("items") {
                    for item in items {
                        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                        let amount = item.get("amount").and_then(|v| v.as_i64()).unwrap_or_default();
                        body.push_str(&format!("{:<40} {}\n", name, format_cents(amount)));
                    }
                }
                let total = self.context.get("amount").and_then(|v| v.as_i64()).unwrap_or_default();
                body.push_str(&format!("\nTotal: {}\n", format_cents(total)));
                body
            }
            EmailTemplate::PaymentFailed => format!(
                "Payment for {} failed.\n\nPlease update the card on file to keep the subscription active.\n",
                org
            ),
            EmailTemplate::InvoiceOverdue => format!(
                "Invoice {} for {} is {} days overdue.\n\nThe subscription will be cancelled in {} days unless it is paid.\n",
                self.field("invoice"),
                org,
                self.field("days_overdue"),
                self.field("days_until_cancellation")
            ),
            EmailTemplate::InvoiceCancelled => format!(
                "Invoice {} for {} is {} days overdue and the subscription has been cancelled.\n",
                self.field("invoice"),
                org,
                self.field("days_overdue")
            ),
            EmailTemplate::Verified => format!(
                "{} has been verified.\n\nVerified members can now use journalist features.\n",
                org
            ),
            EmailTemplate::ChangeRequestTicket => format!(
                "{} requested profile changes for {}.\n\nRequested: {}\nCurrent: {}\n",
                self.field("user"),
                org,
                self.field("requested"),
                self.field("previous")
            ),
        }
    }
}

fn format_cents(amount: i64) -> String {
    format!("${}.{:02}", amount / 100, (amount % 100).abs())
}

/// Resolve symbolic recipients to addresses
pub async fn resolve_recipients(conn: &mut SqliteConnection, recipients: &Recipients) -> anyhow::Result<Vec<String>> {
    match recipients {
        Recipients::To(addresses) => Ok(addresses.clone()),
        Recipients::OrganizationAdmins(org) => MembershipRepository::new(conn).admin_emails(*org).await,
        Recipients::OrganizationReceipts(org) => ReceiptEmailRepository::new(conn).list(*org).await,
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &[String], email: &Email) -> Result<(), EmailError>;
}

/// SMTP delivery
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self, EmailError> {
        let host = config.smtp_host.clone();
        let port = config.smtp_port;

        let mut builder = if config.use_tls {
            let tls_params = TlsParameters::new(host.clone())
                .map_err(|e| EmailError::InvalidConfig(format!("TLS configuration error: {}", e)))?;

            if port == 465 {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
                    .map_err(|e| EmailError::InvalidConfig(format!("SMTP relay error: {}", e)))?
                    .port(port)
                    .tls(Tls::Wrapper(tls_params))
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
                    .map_err(|e| EmailError::InvalidConfig(format!("SMTP relay error: {}", e)))?
                    .port(port)
                    .tls(Tls::Required(tls_params))
            }
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host).port(port)
        };

        if let (Some(user), Some(pass)) = (config.username.clone(), config.password.clone()) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
            from_address: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &[String], email: &Email) -> Result<(), EmailError> {
        let from: Mailbox = self
            .from_address
            .parse()
            .map_err(|e| EmailError::InvalidConfig(format!("Invalid from address: {}", e)))?;
        let body = email.render_body();

        for address in to {
            let message = Message::builder()
                .from(from.clone())
                .to(address
                    .parse()
                    .map_err(|e| EmailError::InvalidAddress(format!("{}: {}", address, e)))?)
                .subject(email.subject.clone())
                .header(ContentType::TEXT_PLAIN)
                .body(body.clone())
                .map_err(|e| EmailError::SendFailed(format!("Failed to build email: {}", e)))?;

            self.transport
                .send(message)
                .await
                .map_err(|e| EmailError::SendFailed(e.to_string()))?;
        }

        Ok(())
    }
}

/// Logs emails instead of sending them; used when email is disabled
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &[String], email: &Email) -> Result<(), EmailError> {
        info!(
            template = ?email.template,
            subject = %email.subject,
            recipients = ?to,
            "Email delivery disabled, not sending"
        );
        Ok(())
    }
}
