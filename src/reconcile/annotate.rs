//! Paints open-state ticks next to sent-message rows in the host list view.
//!
//! A row is bound to a tracked message when its visible subject contains the
//! first 50 characters of the stored subject, the recipients agree whenever
//! both sides know one, and the message is inside the horizon. Candidates are
//! visited oldest first and the first hit wins; two messages sharing a subject
//! prefix and lacking recipient info can therefore land on the wrong row.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::Locale;
use crate::dom::{Document, Element, Selector};
use crate::domain::email::{EpochMs, TrackedMessage, now_ms};
use crate::ipc::{Bridge, Request};
use crate::store::tracked::{TrackedEmails, TrackedStore};
use crate::text::{match_prefix, normalize_line};

pub const SUBJECT_PREFIX_CHARS: usize = 50;
pub const ROW_TAG_ATTR: &str = "data-mail-tracker-email-id";
pub const TICK_CONTAINER_CLASS: &str = "mail-tracker-tick-container";
pub const TICK_CLASS: &str = "mail-tracker-tick";

const MINUTE_MS: EpochMs = 60 * 1000;
const HOUR_MS: EpochMs = 60 * MINUTE_MS;
const DAY_MS: EpochMs = 24 * HOUR_MS;

/// Where rows, their subject and their recipient live in the list view.
#[derive(Debug, Clone)]
pub struct RowMarkup {
    pub row: Selector,
    pub subject: Selector,
    pub recipient: Selector,
    pub tick: Selector,
}

impl RowMarkup {
    pub fn gmail() -> Result<Self> {
        Ok(Self {
            row: Selector::parse(r#"[role="row"]"#)?,
            subject: Selector::parse(r#"[role="link"]"#)?,
            recipient: Selector::parse("[email]")?,
            tick: Selector::parse(&format!(".{TICK_CLASS}"))?,
        })
    }
}

pub fn find_match<'a, I>(
    row_subject: &str,
    row_recipient: Option<&str>,
    candidates: I,
    now: EpochMs,
) -> Option<&'a TrackedMessage>
where
    I: IntoIterator<Item = &'a TrackedMessage>,
{
    let row_recipient = row_recipient.filter(|r| !r.is_empty());
    candidates.into_iter().find(|m| {
        if m.subject.is_empty() || !row_subject.contains(match_prefix(&m.subject, SUBJECT_PREFIX_CHARS)) {
            return false;
        }
        if let Some(r) = row_recipient
            && m.has_known_recipient()
            && r != m.recipient
        {
            return false;
        }
        m.within_horizon(now)
    })
}

pub fn relative_time(at: EpochMs, locale: Locale, now: EpochMs) -> String {
    let diff = now.saturating_sub(at).max(0);
    let plural = |n: i64| if n > 1 { "s" } else { "" };
    if diff < MINUTE_MS {
        return match locale {
            Locale::En => "Just now".to_string(),
            Locale::Fr => "À l'instant".to_string(),
        };
    }
    if diff < HOUR_MS {
        let n = diff / MINUTE_MS;
        return match locale {
            Locale::En => format!("{n} minute{} ago", plural(n)),
            Locale::Fr => format!("Il y a {n} minute{}", plural(n)),
        };
    }
    if diff < DAY_MS {
        let n = diff / HOUR_MS;
        return match locale {
            Locale::En => format!("{n} hour{} ago", plural(n)),
            Locale::Fr => format!("Il y a {n} heure{}", plural(n)),
        };
    }
    DateTime::from_timestamp_millis(at)
        .map(|t| t.with_timezone(&Local).format("%d/%m/%Y %H:%M").to_string())
        .unwrap_or_default()
}

pub fn tooltip(msg: &TrackedMessage, locale: Locale, now: EpochMs) -> String {
    match (msg.opened, locale) {
        (true, _) => {
            let head = match locale {
                Locale::En => format!("Opened by {}", msg.recipient),
                Locale::Fr => format!("Ouvert par {}", msg.recipient),
            };
            match msg.opened_at {
                Some(at) => format!("{head}\n{}", relative_time(at, locale, now)),
                None => head,
            }
        }
        (false, Locale::En) => format!("Sent to {}\nNot opened yet", msg.recipient),
        (false, Locale::Fr) => format!("Envoyé à {}\nPas encore ouvert", msg.recipient),
    }
}

fn paint_tick(tick: &Element, msg: &TrackedMessage, locale: Locale, now: EpochMs) {
    let (variant, glyph) = if msg.opened {
        ("mail-tracker-tick-double", "✓✓")
    } else {
        ("mail-tracker-tick-single", "✓")
    };
    if !tick.has_class(variant) {
        tick.set_attr("class", &format!("{TICK_CLASS} {variant}"));
        tick.clear();
        tick.append_text(glyph);
    }
    tick.set_attr("title", &tooltip(msg, locale, now));
}

/// Annotate every row of `doc`. Rows already carrying a tick are refreshed
/// in place. Returns how many new ticks were painted.
pub fn annotate_rows(
    doc: &Document,
    markup: &RowMarkup,
    emails: &TrackedEmails,
    locale: Locale,
    now: EpochMs,
) -> usize {
    let candidates = TrackedStore::by_creation(emails);
    let mut painted = 0;

    for row in doc.select_all(&markup.row) {
        if let Some(tick) = row.select(&markup.tick) {
            if let Some(msg) = row.attr(ROW_TAG_ATTR).and_then(|id| emails.get(&id)) {
                paint_tick(&tick, msg, locale, now);
            }
            continue;
        }

        let Some(subject_el) = row.select(&markup.subject) else {
            continue;
        };
        let subject = normalize_line(&subject_el.text_content());
        let recipient = row.select(&markup.recipient).and_then(|e| e.attr("email"));

        let Some(msg) = find_match(&subject, recipient.as_deref(), candidates.iter().copied(), now) else {
            continue;
        };

        row.set_attr(ROW_TAG_ATTR, &msg.id);
        let tick = doc.create_element("span");
        paint_tick(&tick, msg, locale, now);
        let container = doc
            .create_element("div")
            .with_attr("class", TICK_CONTAINER_CLASS)
            .with_attr("data-email-id", &msg.id)
            .with_child(tick);
        if subject_el.parent().is_some() {
            subject_el.insert_after(&container);
        } else {
            subject_el.append(&container);
        }
        painted += 1;
        log::debug!(
            "{} tick for {subject:?} ({})",
            if msg.opened { "double" } else { "single" },
            msg.id
        );
    }
    painted
}

/// Fetch the tracked set through `bridge` and annotate once.
pub async fn annotate_once(
    doc: &Document,
    bridge: &dyn Bridge,
    markup: &RowMarkup,
    locale: Locale,
    now: EpochMs,
) -> Result<usize> {
    let resp = bridge.request(Request::GetTrackedEmails).await;
    if !resp.success {
        return Err(anyhow!(
            "fetching tracked emails: {}",
            resp.error.as_deref().unwrap_or("no reason given")
        ));
    }
    let emails: TrackedEmails = match resp.data {
        Some(data) => serde_json::from_value(data)?,
        None => TrackedEmails::new(),
    };
    if emails.is_empty() {
        log::debug!("no tracked emails yet");
        return Ok(0);
    }
    Ok(annotate_rows(doc, markup, &emails, locale, now))
}

/// Annotate now, then every `every`, until `shutdown` flips.
pub async fn run_annotator(
    doc: Document,
    bridge: Arc<dyn Bridge>,
    markup: RowMarkup,
    locale: Locale,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = now_ms();
                match annotate_once(&doc, bridge.as_ref(), &markup, locale, now).await {
                    Ok(0) => {}
                    Ok(n) => log::info!("added {n} tick indicator(s)"),
                    Err(e) => log::warn!("annotation pass failed: {e:#}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("annotator stopped");
}
