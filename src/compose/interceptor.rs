use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::extract::ExtractionPolicy;
use super::watcher::ComposeSession;
use crate::config::{Locale, Settings, Timing};
use crate::dom::{Element, HandlerId};
use crate::domain::email::{BODY_EXCERPT_CHARS, RegistrationRequest};
use crate::ipc::{Bridge, Request};
use crate::text::excerpt;

pub const INDICATOR_CLASS: &str = "mail-tracker-compose-indicator";

pub fn tracked_notice(locale: Locale) -> &'static str {
    match locale {
        Locale::En => "✓ Email will be tracked",
        Locale::Fr => "✓ L'e-mail sera suivi",
    }
}

/// Turns a click on a surface's send affordance into a registration
/// request. The click itself is never held up or cancelled.
pub struct SendInterceptor {
    policy: Arc<ExtractionPolicy>,
    bridge: Arc<dyn Bridge>,
    settings: watch::Receiver<Settings>,
    notification_ttl: Duration,
    locale: Locale,
}

impl SendInterceptor {
    pub fn new(
        policy: Arc<ExtractionPolicy>,
        bridge: Arc<dyn Bridge>,
        settings: watch::Receiver<Settings>,
        timing: &Timing,
        locale: Locale,
    ) -> Self {
        Self {
            policy,
            bridge,
            settings,
            notification_ttl: timing.notification_ttl,
            locale,
        }
    }

    /// Bind the send click. `after_send` runs once the click has been
    /// handled, so the owner can retire the session.
    pub fn bind<F>(self: &Arc<Self>, session: &ComposeSession, button: &Element, after_send: F) -> HandlerId
    where
        F: Fn(&ComposeSession) + Send + Sync + 'static,
    {
        log::debug!("send handler bound for {}", session.assigned_id);
        let this = Arc::clone(self);
        let session = session.clone();
        button.on_click(move |_| {
            this.on_send(&session);
            after_send(&session);
        })
    }

    /// Stop the surface's guard, read the final field values and submit the
    /// registration in the background. `None` when tracking is disabled or
    /// the session was already sent.
    pub fn on_send(&self, session: &ComposeSession) -> Option<JoinHandle<()>> {
        let id = session.assigned_id.clone();
        if !session.mark_sent() {
            log::debug!("{id} already sent, ignoring");
            return None;
        }
        if session.guard.stop() {
            log::debug!("guard stopped for {id}");
        }
        if !self.settings.borrow().tracking_enabled {
            log::info!("tracking disabled, {id} goes out untracked");
            return None;
        }

        let surface = session.surface.clone();
        let req = RegistrationRequest {
            id: id.clone(),
            recipient: self.policy.recipient(&surface),
            subject: self.policy.subject(&surface),
            body: self
                .policy
                .body(&surface)
                .map(|b| excerpt(&b.inner_html(), BODY_EXCERPT_CHARS))
                .unwrap_or_default(),
        };
        log::info!(
            "registering {id}: to={} subject={:?} body={} chars",
            req.recipient,
            req.subject,
            req.body.chars().count()
        );

        let bridge = self.bridge.clone();
        let ttl = self.notification_ttl;
        let locale = self.locale;
        Some(tokio::spawn(async move {
            let resp = bridge.request(Request::RegisterEmail { data: req }).await;
            if resp.is_declined() {
                log::info!("registration of {id} declined");
            } else if resp.success {
                log::info!("{id} registered");
                show_notification(&surface, locale, ttl);
            } else {
                log::error!(
                    "failed to register {id}: {}",
                    resp.error.as_deref().unwrap_or("no reason given")
                );
            }
        }))
    }
}

/// Put a transient "will be tracked" note in the surface footer, replacing
/// any earlier one. Returns the note, which removes itself after `ttl`.
pub fn show_notification(surface: &Element, locale: Locale, ttl: Duration) -> Option<Element> {
    if let Some(old) = surface.query(&format!(".{INDICATOR_CLASS}")) {
        old.remove();
    }
    let Some(footer) = surface.last_element_child() else {
        log::debug!("compose surface has no footer, skipping notification");
        return None;
    };
    let note = surface
        .document()
        .create_element("div")
        .with_attr("class", INDICATOR_CLASS)
        .with_text(tracked_notice(locale));
    footer.append(&note);

    let dismiss = note.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        dismiss.remove();
    });
    Some(note)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Background;
    use crate::background::testing::FakeApi;
    use crate::compose::guard::GuardSlot;
    use crate::config::{DEFAULT_API_URL, KEY_TRACKING_ENABLED};
    use crate::dom::Document;
    use crate::domain::email::NO_SUBJECT;
    use crate::store::repo::{KvStore, MemoryKv};
    use serde_json::json;

    struct Fixture {
        doc: Document,
        kv: Arc<dyn KvStore>,
        api: Arc<FakeApi>,
        bg: Arc<Background>,
        interceptor: Arc<SendInterceptor>,
        settings: watch::Sender<Settings>,
        session: ComposeSession,
        send: Element,
    }

    async fn fixture() -> Fixture {
        let doc = Document::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let api = Arc::new(FakeApi::default());
        let bg = Arc::new(Background::new(kv.clone(), api.clone(), DEFAULT_API_URL));
        let (settings, settings_rx) =
            watch::channel(Settings::load(kv.as_ref(), DEFAULT_API_URL).unwrap());
        let interceptor = Arc::new(SendInterceptor::new(
            Arc::new(ExtractionPolicy::gmail().unwrap()),
            bg.clone(),
            settings_rx,
            &Timing::default(),
            Locale::En,
        ));

        let send = doc
            .create_element("div")
            .with_attr("role", "button")
            .with_attr("aria-label", "Send");
        let footer = doc.create_element("div").with_child(send.clone());
        let body = doc
            .create_element("div")
            .with_attr("contenteditable", "true")
            .with_text(&"x".repeat(800));
        let surface = doc
            .create_element("div")
            .with_attr("role", "dialog")
            .with_child(doc.create_element("span").with_attr("email", "bob@x.com"))
            .with_child(body)
            .with_child(footer);
        doc.body().append(&surface);

        let session = ComposeSession::new(surface, "a1".to_string(), None, GuardSlot::default());
        interceptor.bind(&session, &send, |_| {});
        Fixture {
            doc,
            kv,
            api,
            bg,
            interceptor,
            settings,
            session,
            send,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_registers_and_notifies() {
        let f = fixture().await;
        let task = f.interceptor.on_send(&f.session).unwrap();
        task.await.unwrap();

        let sent = f.api.registered.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, "a1");
        assert_eq!(sent[0].recipient, "bob@x.com");
        assert_eq!(sent[0].subject, NO_SUBJECT);
        assert_eq!(sent[0].body.chars().count(), BODY_EXCERPT_CHARS);
        assert!(!f.bg.tracked_emails().unwrap()["a1"].opened);

        let sel = format!(".{INDICATOR_CLASS}");
        let note = f.session.surface.query(&sel).unwrap();
        assert_eq!(note.text_content(), "✓ Email will be tracked");
        tokio::time::sleep(Duration::from_millis(3010)).await;
        assert!(f.session.surface.query(&sel).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn click_on_bound_button_registers() {
        let f = fixture().await;
        f.doc.click(&f.send);
        while f.api.registered.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.api.registered.lock().unwrap()[0].id, "a1");
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_is_ignored() {
        let f = fixture().await;
        f.interceptor.on_send(&f.session).unwrap().await.unwrap();
        assert!(f.session.is_sent());
        assert!(f.interceptor.on_send(&f.session).is_none());
        f.doc.click(&f.send);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.api.registered.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_tracking_is_a_noop() {
        let f = fixture().await;
        f.kv.set(KEY_TRACKING_ENABLED, json!(false)).unwrap();
        f.settings.send_modify(|s| s.tracking_enabled = false);

        assert!(f.interceptor.on_send(&f.session).is_none());
        assert!(f.api.registered.lock().unwrap().is_empty());
        assert!(f.bg.tracked_emails().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_registration_shows_nothing() {
        let f = fixture().await;
        *f.api.down.lock().unwrap() = true;
        f.interceptor.on_send(&f.session).unwrap().await.unwrap();
        assert!(f.session.surface.query(&format!(".{INDICATOR_CLASS}")).is_none());
        assert!(f.bg.tracked_emails().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notification_replaces_previous_one() {
        let f = fixture().await;
        let ttl = Duration::from_secs(3);
        show_notification(&f.session.surface, Locale::Fr, ttl).unwrap();
        show_notification(&f.session.surface, Locale::Fr, ttl).unwrap();
        let notes = f
            .session
            .surface
            .select_all(&crate::dom::Selector::parse(&format!(".{INDICATOR_CLASS}")).unwrap());
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].text_content(), "✓ L'e-mail sera suivi");
    }
}
