use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type EmailId = String;

/// Milliseconds since the Unix epoch.
pub type EpochMs = i64;

pub const UNKNOWN_RECIPIENT: &str = "unknown";
pub const NO_SUBJECT: &str = "(no subject)";
pub const BODY_EXCERPT_CHARS: usize = 500;

/// Messages older than this are no longer polled nor matched against rows.
pub const HORIZON_MS: EpochMs = 7 * 24 * 60 * 60 * 1000;

pub fn now_ms() -> EpochMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as EpochMs)
        .unwrap_or(0)
}

/// What the send path hands to the background for registration. Field names
/// are the wire names the remote authority expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub id: EmailId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedMessage {
    pub id: EmailId,
    pub recipient: String,
    pub subject: String,
    #[serde(default)]
    pub body_excerpt: String,
    #[serde(alias = "timestamp")]
    pub created_at: EpochMs,
    pub opened: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<EpochMs>,
}

impl TrackedMessage {
    pub fn registered(req: &RegistrationRequest, created_at: EpochMs) -> Self {
        Self {
            id: req.id.clone(),
            recipient: req.recipient.clone(),
            subject: req.subject.clone(),
            body_excerpt: crate::text::excerpt(&req.body, BODY_EXCERPT_CHARS),
            created_at,
            opened: false,
            opened_at: None,
        }
    }

    pub fn age_ms(&self, now: EpochMs) -> EpochMs {
        now.saturating_sub(self.created_at)
    }

    pub fn within_horizon(&self, now: EpochMs) -> bool {
        self.age_ms(now) <= HORIZON_MS
    }

    /// Unopened and young enough to be worth asking the remote authority about.
    pub fn needs_poll(&self, now: EpochMs) -> bool {
        !self.opened && self.within_horizon(now)
    }

    /// `opened` only ever goes false -> true, and `opened_at` is written
    /// exactly once alongside it. Returns whether anything changed.
    pub fn mark_opened(&mut self, at: EpochMs) -> bool {
        if self.opened {
            return false;
        }
        self.opened = true;
        self.opened_at = Some(at);
        true
    }

    pub fn has_known_recipient(&self) -> bool {
        !self.recipient.is_empty() && self.recipient != UNKNOWN_RECIPIENT
    }
}
