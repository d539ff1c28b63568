use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use super::{Bridge, Request, Response, read_frame, write_frame};

/// Client side: one connection per request.
pub struct SocketBridge {
    path: PathBuf,
}

impl SocketBridge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn round_trip(&self, req: &Request) -> Result<Response> {
        let mut s = UnixStream::connect(&self.path).await?;
        write_frame(&mut s, req).await?;
        let v = read_frame(&mut s)
            .await?
            .ok_or_else(|| anyhow::anyhow!("background closed the connection"))?;
        Ok(serde_json::from_value(v)?)
    }
}

#[async_trait]
impl Bridge for SocketBridge {
    async fn request(&self, req: Request) -> Response {
        match self.round_trip(&req).await {
            Ok(r) => r,
            Err(e) => {
                log::error!("{} via {}: {e:#}", req.kind(), self.path.display());
                Response::err(e.to_string())
            }
        }
    }
}

/// Serve requests on `path` until `shutdown` flips.
pub async fn serve(
    path: &Path,
    handler: Arc<dyn Bridge>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    log::info!("listening on {}", path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        log::warn!("client connection: {e:#}");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    let _ = std::fs::remove_file(path);
    Ok(())
}

async fn serve_connection(mut stream: UnixStream, handler: Arc<dyn Bridge>) -> Result<()> {
    while let Some(raw) = read_frame(&mut stream).await? {
        let resp = match Request::decode(raw) {
            Ok(req) => handler.request(req).await,
            Err(e) => {
                log::error!("{e}");
                Response::err(e.to_string())
            }
        };
        write_frame(&mut stream, &resp).await?;
    }
    Ok(())
}
