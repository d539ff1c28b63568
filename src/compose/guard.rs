use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::beacon::Beacon;
use crate::config::Timing;
use crate::dom::Element;

/// Make sure `body` carries the beacon for `id`. Returns whether it had to
/// be inserted.
pub fn ensure_beacon(body: &Element, id: &str, beacon: &Beacon) -> bool {
    if body.inner_html().contains(id) {
        return false;
    }
    body.append(&beacon.to_element(body.document()));
    true
}

/// Keeps a beacon alive in a compose body the host editor may rewrite.
///
/// After `settle_delay` the beacon is appended, then every
/// `guard_interval` the body is checked and repaired. The loop ends on
/// [`GuardHandle::stop`], when the handle is dropped, or once the body
/// leaves the document.
pub struct PixelGuard;

impl PixelGuard {
    pub fn start(body: Element, id: String, beacon: Beacon, timing: &Timing) -> GuardHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let settle = timing.settle_delay;
        let every = timing.guard_interval;

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = stop_rx.changed() => return,
            }
            if ensure_beacon(&body, &id, &beacon) {
                log::debug!("beacon inserted for {id}");
            }

            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if !body.is_connected() {
                            log::debug!("compose body for {id} detached, guard exiting");
                            break;
                        }
                        if ensure_beacon(&body, &id, &beacon) {
                            log::debug!("host stripped beacon for {id}, reinserted");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        GuardHandle {
            stop: stop_tx,
            task,
        }
    }
}

pub struct GuardHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GuardHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Shared, stop-once slot for a surface's guard. The watcher and the send
/// interceptor both hold it; whichever stops first wins.
#[derive(Clone, Default)]
pub struct GuardSlot(Arc<Mutex<Option<GuardHandle>>>);

impl GuardSlot {
    pub fn fill(&self, handle: GuardHandle) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the guard if it is still held. Returns whether this call stopped it.
    pub fn stop(&self) -> bool {
        let taken = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some(h) => {
                h.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl fmt::Debug for GuardSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardSlot")
            .field("running", &self.is_running())
            .finish()
    }
}
