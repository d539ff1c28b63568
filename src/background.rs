use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::Settings;
use crate::domain::email::{RegistrationRequest, TrackedMessage, now_ms};
use crate::ipc::{Bridge, Request, Response};
use crate::remote::{OpenStatus, TrackerApi};
use crate::store::repo::KvStore;
use crate::store::tracked::{TrackedEmails, TrackedStore};

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// The remote authority acknowledged; the message is now in the store.
    Registered(Value),
    /// Tracking is disabled. Not an error.
    Declined,
}

/// Owner of the tracked-email store and the only component that talks to
/// the remote authority. Settings are re-read from the store on every
/// operation since another process may have changed them.
pub struct Background {
    kv: Arc<dyn KvStore>,
    store: TrackedStore,
    api: Arc<dyn TrackerApi>,
    default_api_url: String,
}

impl Background {
    pub fn new(kv: Arc<dyn KvStore>, api: Arc<dyn TrackerApi>, default_api_url: &str) -> Self {
        Self {
            store: TrackedStore::new(kv.clone()),
            kv,
            api,
            default_api_url: default_api_url.to_string(),
        }
    }

    pub fn settings(&self) -> Result<Settings> {
        Settings::load(self.kv.as_ref(), &self.default_api_url)
    }

    pub fn store(&self) -> &TrackedStore {
        &self.store
    }

    pub async fn register(&self, req: RegistrationRequest) -> Result<RegisterOutcome> {
        let settings = self.settings()?;
        if !settings.tracking_enabled {
            log::info!("tracking disabled, not registering {}", req.id);
            return Ok(RegisterOutcome::Declined);
        }

        let ack = self
            .api
            .register(&settings.api_url, &req)
            .await
            .inspect_err(|e| log::error!("registering {} at {}: {e:#}", req.id, settings.api_url))?;

        if self.store.insert_new(TrackedMessage::registered(&req, now_ms()))? {
            log::info!("registered {} for {}", req.id, req.recipient);
        } else {
            log::warn!("{} was already registered, keeping the stored record", req.id);
        }
        Ok(RegisterOutcome::Registered(ack))
    }

    /// Ask the remote authority about `id`, marking it opened locally when
    /// the answer says so.
    pub async fn check_status(&self, id: &str) -> Result<OpenStatus> {
        let settings = self.settings()?;
        let status = self.api.status(&settings.api_url, id).await?;
        if status.opened && self.store.mark_opened(id, now_ms())? {
            log::info!("{id} opened");
        }
        Ok(status)
    }

    pub fn tracked_emails(&self) -> Result<TrackedEmails> {
        self.store.get_all()
    }

    pub async fn handle(&self, req: Request) -> Response {
        let kind = req.kind();
        log::debug!("handling {kind}");
        let result: Result<Value> = match req {
            Request::RegisterEmail { data } => match self.register(data).await {
                Ok(RegisterOutcome::Registered(ack)) => Ok(ack),
                Ok(RegisterOutcome::Declined) => Ok(json!({
                    "declined": true,
                    "message": "tracking is disabled",
                })),
                Err(e) => Err(e),
            },
            Request::CheckStatus { email_id } => self
                .check_status(&email_id)
                .await
                .and_then(|s| Ok(serde_json::to_value(s)?)),
            Request::GetTrackedEmails => self
                .tracked_emails()
                .and_then(|all| Ok(serde_json::to_value(all)?)),
        };
        match result {
            Ok(data) => Response::ok(data),
            Err(e) => {
                log::error!("{kind} failed: {e:#}");
                Response::err(format!("{e:#}"))
            }
        }
    }
}

#[async_trait]
impl Bridge for Background {
    async fn request(&self, req: Request) -> Response {
        self.handle(req).await
    }
}
