use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::compose::extract::ExtractionPolicy;
use crate::compose::watcher::DomWatcher;
use crate::config::{Locale, Settings, Timing};
use crate::dom::{Document, Selector};
use crate::ipc::Bridge;
use crate::reconcile::annotate::{RowMarkup, run_annotator};

/// Present once the host UI has finished its first render.
const READY_LANDMARK: &str = r#"[role="navigation"]"#;

/// Everything the page side runs: the compose watcher and the row annotator.
pub struct PageAgent {
    doc: Document,
    bridge: Arc<dyn Bridge>,
    settings: watch::Receiver<Settings>,
    policy: Arc<ExtractionPolicy>,
    rows: RowMarkup,
    ready: Selector,
    timing: Timing,
    locale: Locale,
}

pub struct PageHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    watcher: Arc<DomWatcher>,
}

impl PageAgent {
    pub fn new(
        doc: Document,
        bridge: Arc<dyn Bridge>,
        settings: watch::Receiver<Settings>,
        timing: Timing,
        locale: Locale,
    ) -> Result<Self> {
        Ok(Self {
            doc,
            bridge,
            settings,
            policy: Arc::new(ExtractionPolicy::gmail()?),
            rows: RowMarkup::gmail()?,
            ready: Selector::parse(READY_LANDMARK)?,
            timing,
            locale,
        })
    }

    pub fn start(self) -> PageHandle {
        let (shutdown, rx) = watch::channel(false);
        let watcher = Arc::new(DomWatcher::new(
            self.doc.clone(),
            self.policy.clone(),
            self.bridge.clone(),
            self.settings.clone(),
            self.timing,
            self.locale,
        ));

        let task = {
            let watcher = watcher.clone();
            tokio::spawn(async move {
                if !self.wait_for_host(rx.clone()).await {
                    return;
                }
                log::info!("host ready, starting compose watcher and annotator");
                tokio::join!(
                    watcher.run(rx.clone()),
                    run_annotator(
                        self.doc.clone(),
                        self.bridge.clone(),
                        self.rows.clone(),
                        self.locale,
                        self.timing.annotate_interval,
                        rx,
                    ),
                );
            })
        };

        PageHandle {
            shutdown,
            task,
            watcher,
        }
    }

    async fn wait_for_host(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let attempts = self.timing.ready_probe_attempts;
        for attempt in 1..=attempts {
            tokio::select! {
                _ = tokio::time::sleep(self.timing.ready_probe_interval) => {}
                _ = shutdown.changed() => return false,
            }
            if self.doc.select(&self.ready).is_some() {
                log::debug!("host ready after {attempt} probe(s)");
                return true;
            }
        }
        log::error!(
            "host UI did not appear after {} attempts, not starting",
            attempts
        );
        false
    }
}

impl PageHandle {
    pub fn watcher(&self) -> &Arc<DomWatcher> {
        &self.watcher
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for both loops to finish.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            log::error!("page agent task failed: {e}");
        }
    }
}
