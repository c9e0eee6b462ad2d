//! Cache invalidation for downstream consumer applications
//!
//! Engines never talk to consumers directly. They record changed entity ids
//! into the [`RequestContext`] (via post-commit hooks), and the context is
//! flushed once at the end of the request. Flushing fans the coalesced batch
//! out into one [`Task::SendInvalidation`] per consumer and entity kind.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::ClientRepository;
use crate::models::ClientApp;
use crate::services::tasks::Task;
use crate::services::Services;
use crate::utils::AppResult;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Organization,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Organization => "organization",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Changed entity ids, deduplicated per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationBatch {
    entries: BTreeMap<EntityKind, BTreeSet<Uuid>>,
}

impl InvalidationBatch {
    pub fn record(&mut self, kind: EntityKind, id: Uuid) {
        self.entries.entry(kind).or_default().insert(id);
    }

    pub fn record_all(&mut self, kind: EntityKind, ids: impl IntoIterator<Item = Uuid>) {
        self.entries.entry(kind).or_default().extend(ids);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|ids| ids.is_empty())
    }

    /// Total number of distinct (kind, id) pairs
    pub fn len(&self) -> usize {
        self.entries.values().map(|ids| ids.len()).sum()
    }

    pub fn ids(&self, kind: EntityKind) -> Vec<Uuid> {
        self.entries
            .get(&kind)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> impl Iterator<Item = (EntityKind, Vec<Uuid>)> + '_ {
        self.entries
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(kind, ids)| (*kind, ids.iter().copied().collect()))
    }
}

/// Per-request accumulator for invalidations.
///
/// `begin` at the start of a request or task, pass `&mut ctx` to engine
/// operations, then `flush` on success or `teardown` on failure.
#[derive(Debug, Default)]
pub struct RequestContext {
    batch: InvalidationBatch,
    finished: bool,
}

impl RequestContext {
    pub fn begin() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EntityKind, id: Uuid) {
        self.batch.record(kind, id);
    }

    pub fn record_all(&mut self, kind: EntityKind, ids: impl IntoIterator<Item = Uuid>) {
        self.batch.record_all(kind, ids);
    }

    pub fn pending(&self) -> &InvalidationBatch {
        &self.batch
    }

    /// Emit everything recorded, returning the number of delivery tasks queued
    pub async fn flush(mut self, notifier: &InvalidationNotifier<'_>) -> AppResult<usize> {
        self.finished = true;
        let batch = std::mem::take(&mut self.batch);
        notifier.notify(&batch).await
    }

    /// Discard everything recorded
    pub fn teardown(mut self) {
        self.finished = true;
        if !self.batch.is_empty() {
            debug!(pending = self.batch.len(), "Discarding request invalidations");
        }
        self.batch = InvalidationBatch::default();
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.finished && !self.batch.is_empty() {
            warn!(
                pending = self.batch.len(),
                "Request context dropped without flush; invalidations discarded"
            );
        }
    }
}

/// Body POSTed to a consumer's webhook URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationPayload {
    pub kind: EntityKind,
    pub uuids: Vec<Uuid>,
    pub timestamp: i64,
    pub signature: String,
}

impl InvalidationPayload {
    pub fn signed(secret: &str, kind: EntityKind, uuids: Vec<Uuid>, timestamp: i64) -> Self {
        let signature = sign_invalidation(secret, timestamp, kind, &uuids);
        Self {
            kind,
            uuids,
            timestamp,
            signature,
        }
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}{kind}{uuid}{uuid}..."`
pub fn sign_invalidation(secret: &str, timestamp: i64, kind: EntityKind, uuids: &[Uuid]) -> String {
    let mut message = format!("{}{}", timestamp, kind.as_str());
    for id in uuids {
        message.push_str(&id.to_string());
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Turns batches into delivery tasks, applying per-consumer consent
pub struct InvalidationNotifier<'a> {
    services: &'a Services,
}

impl<'a> InvalidationNotifier<'a> {
    pub(crate) fn new(services: &'a Services) -> Self {
        Self { services }
    }

    pub async fn notify(&self, batch: &InvalidationBatch) -> AppResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        if !self.services.config.invalidation.enabled {
            debug!(pending = batch.len(), "Cache invalidation disabled");
            return Ok(0);
        }

        let mut conn = self.services.pool.acquire().await?;
        let clients = ClientRepository::new(&mut conn).list_receiving().await?;
        let now = Utc::now();
        let mut queued = 0;

        for client in &clients {
            for (kind, ids) in batch.kinds() {
                let visible = if client.require_consent {
                    let mut repo = ClientRepository::new(&mut conn);
                    match kind {
                        EntityKind::User => repo.consenting_users(client.id, &ids, now).await?,
                        EntityKind::Organization => repo.consenting_organizations(client.id, &ids, now).await?,
                    }
                } else {
                    ids
                };

                if visible.is_empty() {
                    continue;
                }

                self.services.queue.enqueue(Task::SendInvalidation {
                    client_id: client.id,
                    kind,
                    uuids: visible,
                });
                queued += 1;
            }
        }

        debug!(clients = clients.len(), queued, "Queued cache invalidations");
        Ok(queued)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("consumer returned status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Delivers a signed payload to one consumer
#[async_trait]
pub trait InvalidationSender: Send + Sync {
    async fn send(&self, client: &ClientApp, payload: &InvalidationPayload) -> Result<(), DeliveryError>;
}

pub struct HttpInvalidationSender {
    http: reqwest::Client,
}

impl HttpInvalidationSender {
    pub fn new(timeout_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl InvalidationSender for HttpInvalidationSender {
    async fn send(&self, client: &ClientApp, payload: &InvalidationPayload) -> Result<(), DeliveryError> {
        let resp = self.http.post(&client.webhook_url).json(payload).send().await?;
        if !resp.status().is_success() {
            return Err(DeliveryError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
