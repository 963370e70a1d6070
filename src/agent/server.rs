//! Privileged side of the root-agent channel: validation and execution.
//!
//! This code runs as root. The handler table is fixed at compile time, and
//! every handler validates its parameters against a strict allow-list before
//! any command is spawned — domain names against a character pattern, paths
//! against the configured roots, sizes against a sane range. Validation is
//! the privilege boundary's sole defense: a caller-supplied string never
//! reaches a command argument unchecked.
//!
//! Handlers hold no state between calls. Per-domain serialization is the
//! callers' responsibility through the record store lock, not the
//! dispatcher's.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use crate::agent::{AgentRequest, AgentResponse, read_frame, write_frame};
use crate::config::Config;

/// Paths the dispatcher is willing to touch. Everything else is rejected
/// before execution.
#[derive(Debug, Clone)]
pub struct ServerCtx {
    pub state_dir: PathBuf,
    pub storage_path: PathBuf,
    pub cloud_init_dir: PathBuf,
    pub template_path: PathBuf,
}

impl ServerCtx {
    pub fn from_config(config: &Config) -> Self {
        Self {
            state_dir: config.state_dir.clone(),
            storage_path: config.storage_path.clone(),
            cloud_init_dir: config.cloud_init_dir.clone(),
            template_path: config.template_path.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Domain names: alphanumeric first character, then alphanumeric plus
/// `.`, `_`, `-`, at most 64 characters total.
pub fn is_valid_domain_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() || name.len() > 64 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn validate_domain(params: &Value) -> std::result::Result<String, String> {
    match param_str(params, "domain") {
        Some(d) if is_valid_domain_name(d) => Ok(d.to_string()),
        Some(d) => Err(format!("invalid domain name: {d}")),
        None => Err("domain is required".into()),
    }
}

/// Accept `raw` only if it is an absolute path, free of `..` components, and
/// lexically inside `root`. The target may not exist yet (clone destinations
/// don't), so this is deliberately not `canonicalize`.
fn contained_path(root: &Path, raw: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(format!("path must be absolute: {raw}"));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    {
        return Err(format!("path must not contain relative components: {raw}"));
    }
    if !path.starts_with(root) {
        return Err(format!("path must be under {}: {raw}", root.display()));
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> std::result::Result<String, String> {
    let fut = tokio::process::Command::new(program).args(args).output();
    let output = match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(format!("failed to run {program}: {e}")),
        Err(_) => return Err(format!("{program} {} timed out", args.join(" "))),
    };
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.success() {
        Ok(stdout)
    } else if stderr.is_empty() {
        Err(stdout)
    } else {
        Err(stderr)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A virsh subcommand that takes only the validated domain name.
async fn virsh_simple(params: &Value, subcommand: &str, timeout: Duration) -> AgentResponse {
    let domain = match validate_domain(params) {
        Ok(d) => d,
        Err(e) => return AgentResponse::failure(e),
    };
    match run_command("virsh", &[subcommand, &domain], timeout).await {
        Ok(out) => AgentResponse::success(Some(out)),
        Err(e) => AgentResponse::failure(e),
    }
}

async fn virsh_define(params: &Value, ctx: &ServerCtx) -> AgentResponse {
    let Some(raw) = param_str(params, "xml_path") else {
        return AgentResponse::failure("xml_path is required");
    };
    let xml_path = match contained_path(&ctx.state_dir, raw) {
        Ok(p) => p,
        Err(e) => return AgentResponse::failure(e),
    };
    if !xml_path.is_file() {
        return AgentResponse::failure(format!("XML file not found: {}", xml_path.display()));
    }
    match run_command(
        "virsh",
        &["define", &xml_path.to_string_lossy()],
        Duration::from_secs(30),
    )
    .await
    {
        Ok(out) => AgentResponse::success(Some(out)),
        Err(e) => AgentResponse::failure(e),
    }
}

async fn virsh_undefine(params: &Value) -> AgentResponse {
    let domain = match validate_domain(params) {
        Ok(d) => d,
        Err(e) => return AgentResponse::failure(e),
    };
    let remove_storage = params
        .get("remove_storage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut args = vec!["undefine", domain.as_str()];
    if remove_storage {
        args.push("--remove-all-storage");
    }
    match run_command("virsh", &args, Duration::from_secs(60)).await {
        Ok(out) => AgentResponse::success(Some(out)),
        Err(e) => AgentResponse::failure(e),
    }
}

async fn disk_clone(params: &Value, ctx: &ServerCtx) -> AgentResponse {
    let Some(raw_dest) = param_str(params, "dest") else {
        return AgentResponse::failure("dest is required");
    };
    let dest = match contained_path(&ctx.storage_path, raw_dest) {
        Ok(p) => p,
        Err(e) => return AgentResponse::failure(e),
    };
    if dest.extension().and_then(|e| e.to_str()) != Some("qcow2") {
        return AgentResponse::failure("dest must be a .qcow2 path");
    }
    let size_gb = match params.get("size_gb").and_then(Value::as_u64) {
        Some(n) if (1..=2048).contains(&n) => n,
        Some(n) => return AgentResponse::failure(format!("size_gb out of range: {n}")),
        None => return AgentResponse::failure("size_gb is required"),
    };
    if !ctx.template_path.is_file() {
        return AgentResponse::failure(format!(
            "template image not found: {}",
            ctx.template_path.display()
        ));
    }
    let size = format!("{size_gb}G");
    match run_command(
        "qemu-img",
        &[
            "create",
            "-f",
            "qcow2",
            "-b",
            &ctx.template_path.to_string_lossy(),
            "-F",
            "qcow2",
            &dest.to_string_lossy(),
            &size,
        ],
        Duration::from_secs(60),
    )
    .await
    {
        Ok(out) => AgentResponse::success(Some(out)),
        Err(e) => AgentResponse::failure(e),
    }
}

async fn disk_remove(params: &Value, ctx: &ServerCtx) -> AgentResponse {
    let Some(raw) = param_str(params, "path") else {
        return AgentResponse::failure("path is required");
    };
    let path = match contained_path(&ctx.storage_path, raw) {
        Ok(p) => p,
        Err(e) => return AgentResponse::failure(e),
    };
    if path.extension().and_then(|e| e.to_str()) != Some("qcow2") {
        return AgentResponse::failure("path must be a .qcow2 file");
    }
    match tokio::fs::remove_file(&path).await {
        Ok(()) => AgentResponse::success(Some("removed".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            AgentResponse::success(Some("already absent".into()))
        }
        Err(e) => AgentResponse::failure(format!("removing {}: {e}", path.display())),
    }
}

async fn cloudinit_remove(params: &Value, ctx: &ServerCtx) -> AgentResponse {
    let Some(raw) = param_str(params, "path") else {
        return AgentResponse::failure("path is required");
    };
    let path = match contained_path(&ctx.cloud_init_dir, raw) {
        Ok(p) => p,
        Err(e) => return AgentResponse::failure(e),
    };
    // Seed artifacts are either a directory (NoCloud) or a single ISO.
    let result = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
        Ok(_) => tokio::fs::remove_file(&path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return AgentResponse::success(Some("already absent".into()));
        }
        Err(e) => return AgentResponse::failure(format!("stat {}: {e}", path.display())),
    };
    match result {
        Ok(()) => AgentResponse::success(Some("removed".into())),
        Err(e) => AgentResponse::failure(format!("removing {}: {e}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Fixed action table. Anything not listed here does not exist as far as
/// unprivileged callers are concerned.
pub async fn dispatch(request: AgentRequest, ctx: &ServerCtx) -> AgentResponse {
    let params = &request.params;
    match request.action.as_str() {
        "virsh-start" => virsh_simple(params, "start", Duration::from_secs(120)).await,
        // virsh's "destroy" is a forced power-off, not a removal.
        "virsh-destroy" => virsh_simple(params, "destroy", Duration::from_secs(120)).await,
        // Graceful ACPI shutdown; the guest gets time to flush.
        "virsh-shutdown" => virsh_simple(params, "shutdown", Duration::from_secs(300)).await,
        "virsh-reboot" => virsh_simple(params, "reboot", Duration::from_secs(120)).await,
        "virsh-domstate" => virsh_simple(params, "domstate", Duration::from_secs(30)).await,
        "virsh-define" => virsh_define(params, ctx).await,
        "virsh-undefine" => virsh_undefine(params).await,
        "disk-clone" => disk_clone(params, ctx).await,
        "disk-remove" => disk_remove(params, ctx).await,
        "cloudinit-remove" => cloudinit_remove(params, ctx).await,
        other => AgentResponse::failure(format!("unknown action: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Socket loop
// ---------------------------------------------------------------------------

/// Bind the agent socket and serve requests until the process is stopped.
/// One request/response pair per connection; no session state.
pub async fn serve(socket_path: &Path, ctx: ServerCtx) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    // A stale socket file from a previous run would make bind fail.
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing stale {}", socket_path.display())),
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;

    // Only root (and the service group) may talk to the agent.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("chmod {}", socket_path.display()))?;
    }

    info!(socket = %socket_path.display(), "root agent listening");
    let ctx = Arc::new(ctx);
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, &ctx).await;
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: tokio::net::UnixStream, ctx: &ServerCtx) {
    let raw = match read_frame(&mut stream).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "dropping connection: bad frame");
            return;
        }
    };
    let response = match serde_json::from_slice::<AgentRequest>(&raw) {
        Ok(request) => {
            info!(action = %request.action, "dispatching");
            dispatch(request, ctx).await
        }
        Err(e) => AgentResponse::failure(format!("malformed request: {e}")),
    };
    let payload = match serde_json::to_vec(&response) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "response serialization failed");
            return;
        }
    };
    if let Err(e) = write_frame(&mut stream, &payload).await {
        warn!(error = %e, "failed to write response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ctx(dir: &Path) -> ServerCtx {
        ServerCtx {
            state_dir: dir.join("state"),
            storage_path: dir.join("vms"),
            cloud_init_dir: dir.join("cloud-init"),
            template_path: dir.join("template.qcow2"),
        }
    }

    #[test]
    fn domain_name_pattern() {
        assert!(is_valid_domain_name("alice-1"));
        assert!(is_valid_domain_name("a"));
        assert!(is_valid_domain_name("web_server.prod"));
        assert!(is_valid_domain_name("0abc"));

        assert!(!is_valid_domain_name(""));
        assert!(!is_valid_domain_name("-leading-dash"));
        assert!(!is_valid_domain_name(".hidden"));
        assert!(!is_valid_domain_name("has space"));
        assert!(!is_valid_domain_name("semi;colon"));
        assert!(!is_valid_domain_name("dollar$"));
        assert!(!is_valid_domain_name(&"x".repeat(65)));
    }

    #[test]
    fn contained_path_rejects_escapes() {
        let root = Path::new("/var/lib/vmleased/vms");
        assert!(contained_path(root, "/var/lib/vmleased/vms/a.qcow2").is_ok());
        assert!(contained_path(root, "relative/a.qcow2").is_err());
        assert!(contained_path(root, "/var/lib/vmleased/vms/../../etc/shadow").is_err());
        assert!(contained_path(root, "/etc/shadow").is_err());
        assert!(contained_path(root, "/var/lib/vmleased/vms/./a.qcow2").is_err());
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let resp = dispatch(AgentRequest::new("rm-rf", json!({})), &ctx).await;
        assert!(!resp.ok);
        assert!(resp.error_text().contains("unknown action"));
    }

    #[tokio::test]
    async fn invalid_domain_is_rejected_without_execution() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let resp = dispatch(
            AgentRequest::new("virsh-start", json!({"domain": "alice-1; reboot"})),
            &ctx,
        )
        .await;
        assert!(!resp.ok);
        assert!(resp.error_text().contains("invalid domain name"));
    }

    #[tokio::test]
    async fn missing_domain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let resp = dispatch(AgentRequest::new("virsh-destroy", json!({})), &ctx).await;
        assert!(!resp.ok);
        assert!(resp.error_text().contains("domain is required"));
    }

    #[tokio::test]
    async fn define_outside_state_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let resp = dispatch(
            AgentRequest::new("virsh-define", json!({"xml_path": "/etc/passwd"})),
            &ctx,
        )
        .await;
        assert!(!resp.ok);
        assert!(resp.error_text().contains("must be under"));
    }

    #[tokio::test]
    async fn disk_clone_validates_dest_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());

        let resp = dispatch(
            AgentRequest::new(
                "disk-clone",
                json!({"dest": "/tmp/evil.qcow2", "size_gb": 20}),
            ),
            &ctx,
        )
        .await;
        assert!(!resp.ok);

        let dest = ctx.storage_path.join("alice-1.qcow2");
        let resp = dispatch(
            AgentRequest::new(
                "disk-clone",
                json!({"dest": dest.to_string_lossy(), "size_gb": 999999}),
            ),
            &ctx,
        )
        .await;
        assert!(!resp.ok);
        assert!(resp.error_text().contains("size_gb out of range"));
    }

    #[tokio::test]
    async fn disk_remove_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        std::fs::create_dir_all(&ctx.storage_path).unwrap();
        let path = ctx.storage_path.join("ghost.qcow2");
        let resp = dispatch(
            AgentRequest::new("disk-remove", json!({"path": path.to_string_lossy()})),
            &ctx,
        )
        .await;
        assert!(resp.ok);
        assert_eq!(resp.output.as_deref(), Some("already absent"));
    }

    #[tokio::test]
    async fn disk_remove_deletes_existing_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        std::fs::create_dir_all(&ctx.storage_path).unwrap();
        let path = ctx.storage_path.join("alice-1.qcow2");
        std::fs::write(&path, b"qcow2").unwrap();
        let resp = dispatch(
            AgentRequest::new("disk-remove", json!({"path": path.to_string_lossy()})),
            &ctx,
        )
        .await;
        assert!(resp.ok);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cloudinit_remove_handles_dir_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let seed = ctx.cloud_init_dir.join("alice-1");
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::write(seed.join("user-data"), b"#cloud-config\n").unwrap();

        let resp = dispatch(
            AgentRequest::new("cloudinit-remove", json!({"path": seed.to_string_lossy()})),
            &ctx,
        )
        .await;
        assert!(resp.ok);
        assert!(!seed.exists());

        // Second removal: already absent, still success.
        let resp = dispatch(
            AgentRequest::new("cloudinit-remove", json!({"path": seed.to_string_lossy()})),
            &ctx,
        )
        .await;
        assert!(resp.ok);
        assert_eq!(resp.output.as_deref(), Some("already absent"));
    }
}
