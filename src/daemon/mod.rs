pub mod notifier;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::background::Background;
use crate::config::Locale;
use crate::daemon::notifier::Notifier;
use crate::ipc;
use crate::reconcile::poller::run_poller;

pub struct DaemonConfig {
    pub poll_interval: Duration,
    pub socket: PathBuf,
    pub desktop_notifications: bool,
    pub locale: Locale,
}

/// Run the status poller and the request socket side by side until
/// `shutdown` flips.
pub async fn run_daemon(bg: Arc<Background>, cfg: DaemonConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let notifier = cfg.desktop_notifications.then(|| Notifier::new(cfg.locale));
    log::info!(
        "daemon starting: poll every {}s, socket {}",
        cfg.poll_interval.as_secs(),
        cfg.socket.display()
    );

    let poller = run_poller(bg.clone(), cfg.poll_interval, shutdown.clone(), move |m| {
        log::info!("{} opened by {}", m.id, m.recipient);
        if let Some(n) = &notifier {
            n.notify_opened(m);
        }
    });
    let server = ipc::serve(&cfg.socket, bg, shutdown);

    let ((), served) = tokio::join!(poller, server);
    log::info!("daemon stopped");
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::testing::FakeApi;
    use crate::config::DEFAULT_API_URL;
    use crate::domain::email::RegistrationRequest;
    use crate::ipc::{Bridge, Request, SocketBridge};
    use crate::store::repo::MemoryKv;

    #[tokio::test]
    async fn serves_requests_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let api = Arc::new(FakeApi::default());
        let bg = Arc::new(Background::new(Arc::new(MemoryKv::new()), api.clone(), DEFAULT_API_URL));
        let (stop_tx, stop_rx) = watch::channel(false);

        let daemon = tokio::spawn(run_daemon(
            bg.clone(),
            DaemonConfig {
                poll_interval: Duration::from_secs(30),
                socket: socket.clone(),
                desktop_notifications: false,
                locale: Locale::En,
            },
            stop_rx,
        ));
        while !socket.exists() {
            tokio::task::yield_now().await;
        }

        let client = SocketBridge::new(&socket);
        let resp = client
            .request(Request::RegisterEmail {
                data: RegistrationRequest {
                    id: "a1".into(),
                    recipient: "bob@x.com".into(),
                    subject: "Hello".into(),
                    body: "hi".into(),
                },
            })
            .await;
        assert!(resp.success, "{resp:?}");
        assert!(bg.store().get("a1").unwrap().is_some());

        stop_tx.send(true).unwrap();
        daemon.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
