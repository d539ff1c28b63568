//! Foreground ↔ background messaging. Three request types, each answered
//! with `{success, data | error}`; anything else is rejected.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::email::RegistrationRequest;

#[cfg(unix)]
mod socket;
#[cfg(unix)]
pub use socket::{SocketBridge, serve};

const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    RegisterEmail {
        data: RegistrationRequest,
    },
    CheckStatus {
        #[serde(rename = "emailId")]
        email_id: String,
    },
    GetTrackedEmails,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RegisterEmail { .. } => "REGISTER_EMAIL",
            Request::CheckStatus { .. } => "CHECK_STATUS",
            Request::GetTrackedEmails => "GET_TRACKED_EMAILS",
        }
    }

    /// Decode a raw message, naming the offending `type` when it is unknown.
    pub fn decode(raw: Value) -> Result<Self> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("message has no type"))?;
        match kind.as_str() {
            "REGISTER_EMAIL" | "CHECK_STATUS" | "GET_TRACKED_EMAILS" => serde_json::from_value(raw)
                .map_err(|e| anyhow!("malformed {kind} message: {e}")),
            other => Err(anyhow!("unknown message type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Successful answer whose payload says the request was declined.
    pub fn is_declined(&self) -> bool {
        self.success
            && self
                .data
                .as_ref()
                .and_then(|d| d.get("declined"))
                .and_then(Value::as_bool)
                == Some(true)
    }
}

/// Whatever answers [`Request`]s: the in-process background, or a socket to it.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn request(&self, req: Request) -> Response;
}

/// Length-prefixed (u32 big-endian) JSON frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, value: &impl Serialize) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream before a new frame starts.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Value>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let n = u32::from_be_bytes(len_buf) as usize;
    if n > MAX_FRAME {
        return Err(anyhow!("frame of {n} bytes exceeds limit"));
    }
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}
