use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::background::Background;
use crate::domain::email::{EpochMs, TrackedMessage, now_ms};
use crate::store::tracked::TrackedStore;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PollReport {
    /// The cycle did not run because tracking is disabled.
    pub disabled: bool,
    pub checked: usize,
    pub newly_opened: Vec<TrackedMessage>,
    pub failed: usize,
}

/// Ask the remote authority about every unopened message inside the
/// horizon. A failed check only skips that message for this cycle.
pub async fn poll_once(bg: &Background, now: EpochMs) -> Result<PollReport> {
    if !bg.settings()?.tracking_enabled {
        log::debug!("tracking disabled, skipping status poll");
        return Ok(PollReport {
            disabled: true,
            ..Default::default()
        });
    }

    let all = bg.tracked_emails()?;
    let due: Vec<String> = TrackedStore::by_creation(&all)
        .into_iter()
        .filter(|m| m.needs_poll(now))
        .map(|m| m.id.clone())
        .collect();

    let mut report = PollReport::default();
    for id in due {
        report.checked += 1;
        match bg.check_status(&id).await {
            Ok(status) if status.opened => {
                if let Some(m) = bg.store().get(&id)? {
                    report.newly_opened.push(m);
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("status check for {id} failed: {e:#}");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Poll now, then every `every`, until `shutdown` flips. `on_opened` sees
/// each message the first time it is found opened.
pub async fn run_poller<F>(bg: Arc<Background>, every: Duration, mut shutdown: watch::Receiver<bool>, mut on_opened: F)
where
    F: FnMut(&TrackedMessage) + Send,
{
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => match poll_once(&bg, now_ms()).await {
                Ok(report) => {
                    if report.checked > 0 {
                        log::debug!(
                            "polled {} message(s): {} opened, {} failed",
                            report.checked,
                            report.newly_opened.len(),
                            report.failed
                        );
                    }
                    for m in &report.newly_opened {
                        on_opened(m);
                    }
                }
                Err(e) => log::error!("status poll failed: {e:#}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("status poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::testing::FakeApi;
    use crate::config::{DEFAULT_API_URL, KEY_TRACKING_ENABLED};
    use crate::domain::email::{HORIZON_MS, RegistrationRequest};
    use crate::store::repo::{KvStore, MemoryKv};
    use serde_json::json;
    use std::sync::Mutex;

    const NOW: EpochMs = 1_750_000_000_000;

    fn msg(id: &str, created_at: EpochMs) -> TrackedMessage {
        TrackedMessage::registered(
            &RegistrationRequest {
                id: id.into(),
                recipient: "bob@x.com".into(),
                subject: "Hello".into(),
                body: "hi".into(),
            },
            created_at,
        )
    }

    fn setup() -> (Arc<MemoryKv>, Arc<FakeApi>, Arc<Background>) {
        let kv = Arc::new(MemoryKv::new());
        let api = Arc::new(FakeApi::default());
        let bg = Arc::new(Background::new(kv.clone(), api.clone(), DEFAULT_API_URL));
        (kv, api, bg)
    }

    #[tokio::test]
    async fn only_young_unopened_messages_are_checked() {
        let (_kv, api, bg) = setup();
        let store = bg.store();
        store.insert(msg("fresh", NOW - 1_000)).unwrap();
        store.insert(msg("stale", NOW - HORIZON_MS - 1)).unwrap();
        let mut done = msg("done", NOW - 1_000);
        done.mark_opened(NOW - 500);
        store.insert(done).unwrap();
        api.open("stale");

        let report = poll_once(&bg, NOW).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(*api.status_calls.lock().unwrap(), vec!["fresh".to_string()]);
        assert!(!store.get("stale").unwrap().unwrap().opened);
    }

    #[tokio::test]
    async fn opened_answer_marks_store_and_reports() {
        let (_kv, api, bg) = setup();
        bg.store().insert(msg("a1", NOW - 1_000)).unwrap();
        api.open("a1");

        let report = poll_once(&bg, NOW).await.unwrap();
        assert_eq!(report.newly_opened.len(), 1);
        assert_eq!(report.newly_opened[0].id, "a1");
        assert!(bg.store().get("a1").unwrap().unwrap().opened);

        let again = poll_once(&bg, NOW).await.unwrap();
        assert_eq!(again.checked, 0);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_cycle() {
        let (_kv, api, bg) = setup();
        bg.store().insert(msg("a1", NOW - 2_000)).unwrap();
        bg.store().insert(msg("a2", NOW - 1_000)).unwrap();
        api.failing.lock().unwrap().insert("a1".into());
        api.open("a2");

        let report = poll_once(&bg, NOW).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.newly_opened.len(), 1);
        assert!(!bg.store().get("a1").unwrap().unwrap().opened);
    }

    #[tokio::test]
    async fn disabled_tracking_skips_the_cycle() {
        let (kv, api, bg) = setup();
        bg.store().insert(msg("a1", NOW - 1_000)).unwrap();
        kv.set(KEY_TRACKING_ENABLED, json!(false)).unwrap();

        let report = poll_once(&bg, NOW).await.unwrap();
        assert!(report.disabled);
        assert!(api.status_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_polls_immediately_then_on_interval() {
        let (_kv, api, bg) = setup();
        bg.store().insert(msg("a1", now_ms())).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = {
            let seen = seen.clone();
            tokio::spawn(run_poller(bg.clone(), Duration::from_secs(30), stop_rx, move |m| {
                seen.lock().unwrap().push(m.id.clone())
            }))
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.status_calls.lock().unwrap().len(), 1);

        api.open("a1");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a1".to_string()]);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
