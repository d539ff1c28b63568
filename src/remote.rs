use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::domain::email::RegistrationRequest;

/// Answer of `GET {endpoint}/email/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenStatus {
    #[serde(default)]
    pub opened: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The remote authority. The endpoint is passed per call because it can
/// change while the process runs.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    async fn register(&self, endpoint: &str, req: &RegistrationRequest) -> Result<Value>;
    async fn status(&self, endpoint: &str, id: &str) -> Result<OpenStatus>;
}

pub struct HttpTrackerApi {
    client: reqwest::Client,
}

impl HttpTrackerApi {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

pub(crate) fn endpoint_url(endpoint: &str, path: &str) -> Result<Url> {
    Url::parse(&format!("{}{}", endpoint.trim_end_matches('/'), path))
        .with_context(|| format!("invalid API url '{endpoint}'"))
}

async fn json_or_status(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ));
    }
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl TrackerApi for HttpTrackerApi {
    async fn register(&self, endpoint: &str, req: &RegistrationRequest) -> Result<Value> {
        let url = endpoint_url(endpoint, "/email/register")?;
        log::debug!("POST {url} id={} body_len={}", req.id, req.body.len());
        let resp = self
            .client
            .post(url.clone())
            .json(req)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        json_or_status(resp).await
    }

    async fn status(&self, endpoint: &str, id: &str) -> Result<OpenStatus> {
        let mut url = endpoint_url(endpoint, "/email/status")?;
        url.query_pairs_mut().append_pair("id", id);
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let v = json_or_status(resp).await?;
        Ok(serde_json::from_value(v)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn api() -> HttpTrackerApi {
        HttpTrackerApi {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    /// Accept one connection, answer it with `status` and `body`, and hand
    /// back the raw request that came in.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            sock.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (endpoint, task)
    }

    #[tokio::test]
    async fn status_query_is_encoded_and_answer_parsed() {
        let (endpoint, server) = serve_once("200 OK", r#"{"opened":true,"openCount":2}"#).await;
        let status = api().status(&endpoint, "a1&b").await.unwrap();
        assert!(status.opened);
        assert_eq!(status.extra["openCount"], 2);
        let request = server.await.unwrap();
        assert!(
            request.starts_with("GET /email/status?id=a1%26b HTTP/1.1\r\n"),
            "{request}"
        );
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let (endpoint, server) = serve_once("500 Internal Server Error", r#"{"opened":true}"#).await;
        let err = api().status(&endpoint, "a1").await.unwrap_err();
        assert!(err.to_string().starts_with("HTTP 500"), "{err}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn register_posts_json_and_accepts_empty_body() {
        let (endpoint, server) = serve_once("200 OK", "").await;
        let req = RegistrationRequest {
            id: "a1".into(),
            recipient: "bob@x.com".into(),
            subject: "Hello".into(),
            body: "hi".into(),
        };
        assert_eq!(api().register(&endpoint, &req).await.unwrap(), Value::Null);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /email/register HTTP/1.1\r\n"), "{request}");
        assert!(request.contains(r#""id":"a1""#), "{request}");
        assert!(request.contains(r#""recipient":"bob@x.com""#), "{request}");
    }

    #[test]
    fn endpoint_paths_join_cleanly() {
        let u = endpoint_url("http://h:3000/", "/email/register").unwrap();
        assert_eq!(u.as_str(), "http://h:3000/email/register");
        assert!(endpoint_url("::", "/email/status").is_err());
    }

    #[test]
    fn status_keeps_unknown_fields() {
        let s: OpenStatus =
            serde_json::from_str(r#"{"opened":true,"openCount":3}"#).unwrap();
        assert!(s.opened);
        assert_eq!(s.extra["openCount"], 3);
    }
}
