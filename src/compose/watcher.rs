use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

use super::extract::ExtractionPolicy;
use super::guard::{GuardSlot, PixelGuard};
use super::interceptor::SendInterceptor;
use crate::beacon::{Beacon, build_beacon};
use crate::config::{Locale, Settings, Timing};
use crate::dom::{Document, Element, HandlerId, NodeId};
use crate::identity;
use crate::ipc::Bridge;

/// Set on a surface before anything else happens to it.
pub const PROCESSED_ATTR: &str = "data-mail-tracker-processed";
pub const EMAIL_ID_ATTR: &str = "data-email-id";

/// One compose surface from discovery to send or teardown. Clones share
/// the guard and the sent flag.
#[derive(Debug, Clone)]
pub struct ComposeSession {
    pub surface: Element,
    pub assigned_id: String,
    /// `None` when the message will go out unbeaconed.
    pub beacon: Option<Beacon>,
    pub guard: GuardSlot,
    sent: Arc<AtomicBool>,
    send_handler: Option<HandlerId>,
}

impl ComposeSession {
    pub fn new(surface: Element, assigned_id: String, beacon: Option<Beacon>, guard: GuardSlot) -> Self {
        Self {
            surface,
            assigned_id,
            beacon,
            guard,
            sent: Arc::new(AtomicBool::new(false)),
            send_handler: None,
        }
    }

    /// `true` for the first call only. Send is handled once per session.
    pub fn mark_sent(&self) -> bool {
        !self.sent.swap(true, Ordering::SeqCst)
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Stop the guard and unbind the send handler.
    fn retire(&self) {
        self.guard.stop();
        if let Some(h) = self.send_handler {
            self.surface.document().off_click(h);
        }
    }
}

type SessionMap = HashMap<NodeId, ComposeSession>;

fn lock_sessions(sessions: &Mutex<SessionMap>) -> MutexGuard<'_, SessionMap> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watches the document for compose surfaces and runs the pipeline once
/// per surface: assign an id, guard a beacon in the body, bind send.
pub struct DomWatcher {
    doc: Document,
    policy: Arc<ExtractionPolicy>,
    settings: watch::Receiver<Settings>,
    interceptor: Arc<SendInterceptor>,
    timing: Timing,
    sessions: Arc<Mutex<SessionMap>>,
}

impl DomWatcher {
    pub fn new(
        doc: Document,
        policy: Arc<ExtractionPolicy>,
        bridge: Arc<dyn Bridge>,
        settings: watch::Receiver<Settings>,
        timing: Timing,
        locale: Locale,
    ) -> Self {
        let interceptor = Arc::new(SendInterceptor::new(
            policy.clone(),
            bridge,
            settings.clone(),
            &timing,
            locale,
        ));
        Self {
            doc,
            policy,
            settings,
            interceptor,
            timing,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sessions_lock(&self) -> MutexGuard<'_, SessionMap> {
        lock_sessions(&self.sessions)
    }

    pub fn sessions(&self) -> Vec<ComposeSession> {
        self.sessions_lock().values().cloned().collect()
    }

    pub fn session_for(&self, surface: &Element) -> Option<ComposeSession> {
        self.sessions_lock().get(&surface.id()).cloned()
    }

    /// Drop sessions whose surface left the document, then start a pipeline
    /// for every unprocessed surface. Returns how many were started.
    pub fn scan(&self) -> usize {
        let dropped = self.teardown_detached();
        if dropped > 0 {
            log::debug!("tore down {dropped} closed compose surface(s)");
        }

        let mut started = 0;
        for surface in self.doc.select_all(&self.policy.surface) {
            if surface.attr(PROCESSED_ATTR).is_some() {
                continue;
            }
            surface.set_attr(PROCESSED_ATTR, "true");
            self.start_session(surface);
            started += 1;
        }
        started
    }

    fn start_session(&self, surface: Element) {
        let id = identity::generate();
        surface.set_attr(EMAIL_ID_ATTR, &id);
        log::info!("compose surface found, assigned {id}");

        let settings = self.settings.borrow().clone();
        let guard = GuardSlot::default();
        let beacon = if !settings.tracking_enabled {
            log::info!("tracking disabled, no beacon for {id}");
            None
        } else {
            self.arm_beacon(&surface, &id, &settings.api_url, &guard)
        };

        let mut session = ComposeSession::new(surface.clone(), id, beacon, guard);
        match self.policy.send_button(&surface) {
            Some(button) => {
                let sessions = Arc::downgrade(&self.sessions);
                let handler = self.interceptor.bind(&session, &button, move |sent| {
                    let Some(sessions) = sessions.upgrade() else {
                        return;
                    };
                    let done = lock_sessions(&sessions).remove(&sent.surface.id());
                    if let Some(done) = done {
                        done.retire();
                        log::debug!("compose session {} finished", done.assigned_id);
                    }
                });
                session.send_handler = Some(handler);
            }
            None => log::warn!(
                "no send button found for {}, it will not be registered",
                session.assigned_id
            ),
        }
        self.sessions_lock().insert(surface.id(), session);
    }

    fn arm_beacon(&self, surface: &Element, id: &str, api_url: &str, guard: &GuardSlot) -> Option<Beacon> {
        let Some(body) = self.policy.body(surface) else {
            log::warn!("no compose body found for {id}, message will be sent unbeaconed");
            return None;
        };
        match build_beacon(api_url, id) {
            Ok(beacon) => {
                guard.fill(PixelGuard::start(body, id.to_string(), beacon.clone(), &self.timing));
                Some(beacon)
            }
            Err(e) => {
                log::warn!("{e:#}, message {id} will be sent unbeaconed");
                None
            }
        }
    }

    fn teardown_detached(&self) -> usize {
        let mut sessions = self.sessions_lock();
        let before = sessions.len();
        sessions.retain(|_, s| {
            if s.surface.is_connected() {
                return true;
            }
            s.retire();
            log::debug!("compose surface for {} closed", s.assigned_id);
            false
        });
        before - sessions.len()
    }

    /// Rescan on every structural change until `shutdown` flips. Guards
    /// still running at that point are stopped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut mutations = self.doc.subscribe();
        self.scan();
        loop {
            tokio::select! {
                m = mutations.recv() => match m {
                    Ok(_) => {
                        self.scan();
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("missed {n} mutation events, rescanning");
                        self.scan();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        for s in self.sessions_lock().drain().map(|(_, s)| s) {
            s.retire();
        }
        log::debug!("dom watcher stopped");
    }
}
