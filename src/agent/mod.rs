//! Root-agent RPC protocol: the only path across the privilege boundary.
//!
//! Unprivileged lifecycle code never runs hypervisor commands itself. It
//! sends one framed request over the agent's Unix socket and awaits exactly
//! one framed response. The privileged daemon (`vmleased-rootd`) validates
//! every parameter before executing anything — see [`server`].
//!
//! ## Framing
//!
//! ```text
//! +----------------+---------------------------+
//! | u32 big-endian |  exactly that many bytes  |
//! |  payload len   |  of JSON payload          |
//! +----------------+---------------------------+
//! ```
//!
//! Both directions use the same framing. Readers loop with `read_exact`, so
//! a partial read can never be mistaken for a complete message. Frames above
//! [`MAX_FRAME_BYTES`] are rejected before any allocation.

pub mod client;
pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Upper bound on a single frame. virsh output fits comfortably; anything
/// larger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default round-trip timeout. Graceful shutdown is the slowest action the
/// agent performs, and it is itself bounded at 300 s.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl AgentRequest {
    pub fn new(action: &str, params: serde_json::Value) -> Self {
        Self {
            action: action.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl AgentResponse {
    pub fn success(output: Option<String>) -> Self {
        Self {
            ok: true,
            error: None,
            output,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            output: None,
        }
    }

    /// The error text, or an empty string for a success response.
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame, rejecting oversized lengths before
/// allocating the payload buffer.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("incoming frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// The unprivileged side's view of the root agent. The production
/// implementation is [`client::AgentClient`]; tests substitute their own.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// One request, one response, under a hard timeout. Timeout or transport
    /// failure is a connection error — the action's outcome is unknown and
    /// must be reconciled by a later status query, never assumed failed.
    async fn call(&self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, b"{\"action\":\"virsh-start\"}")
            .await
            .unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, b"{\"action\":\"virsh-start\"}");
    }

    #[tokio::test]
    async fn reader_waits_for_complete_frame() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        // Write the length prefix and half the payload, then the rest after
        // a delay; the reader must assemble the whole frame.
        let writer = tokio::spawn(async move {
            a.write_all(&8u32.to_be_bytes()).await.unwrap();
            a.write_all(b"abcd").await.unwrap();
            a.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            a.write_all(b"efgh").await.unwrap();
            a.flush().await.unwrap();
        });
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, b"abcdefgh");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error_not_a_message() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&16u32.to_be_bytes()).await.unwrap();
        a.write_all(b"only-eight").await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn response_serialization_omits_absent_fields() {
        let resp = AgentResponse::success(Some("Domain started".into()));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"ok\":true"));
        assert!(!json.contains("error"));

        let resp = AgentResponse::failure("no such domain");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"ok\":false"));
        assert!(!json.contains("output"));
    }

    #[test]
    fn request_params_default_to_null() {
        let req: AgentRequest = serde_json::from_str(r#"{"action":"virsh-start"}"#).unwrap();
        assert_eq!(req.action, "virsh-start");
        assert!(req.params.is_null());
    }
}
