//! Post-create credential-mint hook.
//!
//! Minting the on-chain access credential is a collaborator concern; this
//! crate only invokes the configured external command and records the
//! result. A mint failure never blocks VM activation — the owner can re-mint
//! out of band.

use std::time::Duration;

use tracing::{info, warn};

/// Hard cap on the mint command; chain interaction can be slow but not
/// unbounded.
const MINT_TIMEOUT: Duration = Duration::from_secs(120);

/// Run the mint command for a freshly created VM. Returns the transaction
/// hash printed on stdout, or `None` on any failure (which is logged, not
/// propagated).
pub async fn mint_credential(command: &str, owner_wallet: &str, machine_id: &str) -> Option<String> {
    let fut = tokio::process::Command::new(command)
        .arg("--owner-wallet")
        .arg(owner_wallet)
        .arg("--machine-id")
        .arg(machine_id)
        .output();

    let output = match tokio::time::timeout(MINT_TIMEOUT, fut).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            warn!(command, machine_id, error = %e, "mint hook failed to start");
            return None;
        }
        Err(_) => {
            warn!(command, machine_id, "mint hook timed out");
            return None;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            command,
            machine_id,
            status = ?output.status.code(),
            stderr = %stderr.trim(),
            "mint hook exited nonzero"
        );
        return None;
    }

    let tx_hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if tx_hash.is_empty() {
        warn!(command, machine_id, "mint hook printed no transaction hash");
        return None;
    }
    info!(machine_id, tx_hash = %tx_hash, "access credential minted");
    Some(tx_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_command_yields_none_not_error() {
        let result =
            mint_credential("/nonexistent/vmleased-mint", "0xabc", "alice-1").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn trimmed_stdout_is_the_tx_hash() {
        // `echo` stands in for the real mint command.
        let result = mint_credential("echo", "0xabc", "alice-1").await;
        // echo prints its arguments back; the hook only cares that stdout is
        // non-empty on success.
        assert!(result.is_some());
        assert!(!result.unwrap().ends_with('\n'));
    }
}
