//! Unprivileged client side of the root-agent channel.
//!
//! One Unix-socket connection per call: connect, send the framed request,
//! read the framed response, done. No session state survives the call, which
//! keeps the privileged daemon trivially restartable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tracing::debug;

use crate::agent::{AgentRequest, AgentResponse, AgentTransport, read_frame, write_frame};
use crate::error::{LeaseError, Result};

#[derive(Debug, Clone)]
pub struct AgentClient {
    socket_path: PathBuf,
}

impl AgentClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    async fn round_trip(&self, request: &AgentRequest) -> std::io::Result<Vec<u8>> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let payload = serde_json::to_vec(request)?;
        write_frame(&mut stream, &payload).await?;
        read_frame(&mut stream).await
    }
}

#[async_trait]
impl AgentTransport for AgentClient {
    async fn call(&self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse> {
        debug!(action = %request.action, "root-agent call");
        let raw = match tokio::time::timeout(timeout, self.round_trip(&request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                return Err(LeaseError::Connection(format!(
                    "{} ({})",
                    e,
                    self.socket_path.display()
                )));
            }
            Err(_) => {
                return Err(LeaseError::Connection(format!(
                    "call '{}' timed out after {:?}; outcome unknown",
                    request.action, timeout
                )));
            }
        };
        // A malformed response means the agent did answer — the action's
        // outcome is known to the privileged side even if we cannot read it.
        let response: AgentResponse = serde_json::from_slice(&raw)
            .map_err(|e| LeaseError::Agent(format!("malformed response: {e}")))?;
        debug!(action = %request.action, ok = response.ok, "root-agent reply");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unreachable_socket_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = AgentClient::new(&dir.path().join("missing.sock"));
        let err = client
            .call(
                AgentRequest::new("virsh-start", json!({"domain": "alice-1"})),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Connection(_)));
        assert!(err.outcome_unknown());
    }

    #[tokio::test]
    async fn silent_server_times_out_as_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();
        // Accept but never respond.
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = AgentClient::new(&sock);
        let err = client
            .call(
                AgentRequest::new("virsh-domstate", json!({"domain": "alice-1"})),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Connection(_)));
        server.abort();
    }
}
