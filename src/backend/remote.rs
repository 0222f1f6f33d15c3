//! The remote daemon backend (spec §4.6) — file and exec operations routed
//! over SSH/SFTP (C3) dialed through a WebSocket tunnel (C2), behind the
//! connection-status machine (C4) and reconnection controller (C5).
//!
//! Grounded on the teacher's `SandboxHandle` implementations
//! (`sandbox/backends/*.rs`), which inject external collaborators
//! (`Arc<dyn ...>`) for anything out of the core's scope — here the
//! dangerous-command guard is an injected `Arc<dyn CommandSafetyOracle>`,
//! mirroring how the teacher injects `Arc<dyn GithubClient>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::scoped::ScopedBackend;
use super::{
    Backend, BackendKind, ChildRegistry, ExecContent, ExecOptions, ExecOutcome, FileStat,
    MkdirOptions, RmOptions,
};
use crate::error::BackendError;
use crate::path::PathValidator;
use crate::reconnect::{ReconnectConfig, ReconnectController};
use crate::ssh_session::{SshConfig, SshSession};
use crate::status::{ConnectionStatus, StatusManager};
use crate::tunnel::WsTunnel;

/// A verdict from the (external, pluggable) command-safety oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Dangerous(String),
    Unsafe(String),
}

/// The hard denylist + reasoned safety check described in spec §4.6. The
/// oracle's internals are out of scope for the core (spec §1); this trait
/// is the interface the core needs.
pub trait CommandSafetyOracle: Send + Sync {
    fn check(&self, command: &str) -> SafetyVerdict;
}

/// Default oracle used when `prevent_dangerous` is unset: everything is safe.
pub struct NoopOracle;

impl CommandSafetyOracle for NoopOracle {
    fn check(&self, _command: &str) -> SafetyVerdict {
        SafetyVerdict::Safe
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub root_dir: String,
    /// Cosmetic labels forwarded to `WsTunnel::create_connection` — see
    /// spec §4.2.
    pub host: String,
    pub port: u16,
    pub ws_url: String,
    pub auth_token: Option<String>,
    pub max_output_length: Option<usize>,
    pub prevent_dangerous: bool,
    pub reconnect: ReconnectConfig,
    pub ssh: SshConfig,
}

/// Anything the backend has handed out that holds an external resource
/// (MCP sessions, primarily) and must be torn down on destroy.
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self);
}

pub struct RemoteBackend {
    config: RemoteConfig,
    validator: PathValidator,
    status: Arc<StatusManager>,
    reconnect: Arc<ReconnectController>,
    session: tokio::sync::Mutex<Option<Arc<SshSession>>>,
    oracle: Arc<dyn CommandSafetyOracle>,
    closeables: Mutex<Vec<Arc<dyn Closeable>>>,
    children: ChildRegistry,
    destroyed: AtomicBool,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Arc<Self> {
        Self::with_oracle(config, Arc::new(NoopOracle))
    }

    pub fn with_oracle(config: RemoteConfig, oracle: Arc<dyn CommandSafetyOracle>) -> Arc<Self> {
        let validator = PathValidator::posix(config.root_dir.clone());
        let status = Arc::new(StatusManager::new());
        let reconnect = Arc::new(ReconnectController::new(config.reconnect.clone(), status.clone()));
        Arc::new(Self {
            config,
            validator,
            status,
            reconnect,
            session: tokio::sync::Mutex::new(None),
            oracle,
            closeables: Mutex::new(Vec::new()),
            children: ChildRegistry::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.status()
    }

    pub fn status_manager(&self) -> Arc<StatusManager> {
        self.status.clone()
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionClosed);
        }
        Ok(())
    }

    /// Track a closeable so `destroy` tears it down transitively.
    pub fn track_closeable(&self, closeable: Arc<dyn Closeable>) {
        self.closeables.lock().push(closeable);
    }

    /// Establish (or reuse) the SSH session over the WebSocket tunnel.
    async fn ensure_connected(&self) -> Result<Arc<SshSession>, BackendError> {
        self.check_alive()?;
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let _ = self.status.set(ConnectionStatus::Connecting, None);
        let mut tunnel = WsTunnel::dial(&self.config.ws_url, self.config.auth_token.as_deref())
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        let stream = tunnel
            .create_connection(&self.config.host, self.config.port)
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        let session = SshSession::connect(stream, &self.config.ssh, tunnel)
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        let session = Arc::new(session);
        *guard = Some(session.clone());
        let _ = self.status.set(ConnectionStatus::Connected, None);
        Ok(session)
    }
}

/// Build the single shell line spec §4.6 describes for `exec`:
/// `cd <cwd> && HOME=<cwd> <env assignments> <cmd>`.
pub fn build_exec_line(cwd: &str, env: &BTreeMap<String, String>, cmd: &str) -> String {
    let mut line = format!("cd {cwd} && HOME={cwd} ");
    for (k, v) in env {
        line.push_str(&format!("{k}={v} "));
    }
    line.push_str(cmd);
    line
}

/// Truncate `stdout` to `max_len` bytes (when set and nonzero), per spec
/// §4.6: first `(max_len - 50)` bytes plus a sentinel line.
pub fn truncate_output(stdout: &str, max_len: Option<usize>) -> (String, bool) {
    let Some(max_len) = max_len.filter(|&n| n > 0) else {
        return (stdout.to_string(), false);
    };
    if stdout.len() <= max_len {
        return (stdout.to_string(), false);
    }
    let shown = max_len.saturating_sub(50);
    let mut boundary = shown.min(stdout.len());
    while !stdout.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let head = &stdout[..boundary];
    let truncated = format!(
        "{head}\n...[truncated, original length {} bytes, showing {} bytes]",
        stdout.len(),
        boundary
    );
    (truncated, true)
}

/// Translate a validated absolute path's *parent* into a path relative to
/// `root` for use with SFTP `mkdir`/`makedirs` calls — the SFTP server is
/// chrooted to `root`, so it must never see `root` as part of the path it
/// is given (spec §4.6's sharpest footgun).
pub fn relative_parent_for_sftp(root: &Path, absolute: &Path) -> Option<PathBuf> {
    let parent = absolute.parent()?;
    if parent == root {
        return None;
    }
    parent.strip_prefix(root).ok().map(|p| p.to_path_buf())
}

/// Same translation, but for a directory path itself (used by `mkdir`).
pub fn relative_for_sftp(root: &Path, absolute: &Path) -> PathBuf {
    absolute.strip_prefix(root).unwrap_or(absolute).to_path_buf()
}

#[async_trait]
impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteFilesystem
    }

    fn root_dir(&self) -> &str {
        &self.config.root_dir
    }

    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecOutcome, BackendError> {
        self.check_alive()?;
        if cmd.trim().is_empty() {
            return Err(BackendError::EmptyCommand);
        }
        if self.config.prevent_dangerous {
            match self.oracle.check(cmd) {
                SafetyVerdict::Dangerous(reason) => return Err(BackendError::DangerousOperation(reason)),
                SafetyVerdict::Unsafe(reason) => return Err(BackendError::UnsafeCommand { reason }),
                SafetyVerdict::Safe => {}
            }
        }

        let cwd = opts.cwd.clone().unwrap_or_else(|| self.config.root_dir.clone());
        let line = build_exec_line(&cwd, &opts.env, cmd);

        let session = self.ensure_connected().await?;
        let output = session
            .run(&line)
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;

        if output.returncode != 0 {
            return Err(BackendError::ExecFailed {
                code: Some(output.returncode),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let (text, _truncated) = truncate_output(&raw, self.config.max_output_length);

        let stdout = match opts.encoding {
            super::Encoding::Text => ExecContent::Text(text),
            // Spec §9 Open Question 1: preserve the lossy round-trip —
            // the already-UTF-8-decoded string is re-encoded to bytes.
            super::Encoding::Buffer => ExecContent::Bytes(text.into_bytes()),
        };

        Ok(ExecOutcome {
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.returncode,
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let session = self.ensure_connected().await?;
        session
            .sftp_read(p.to_string_lossy().as_ref())
            .await
            .map_err(|e| BackendError::ReadFailed(e.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let session = self.ensure_connected().await?;

        if let Some(relative_parent) = relative_parent_for_sftp(self.validator.root(), &p) {
            session
                .sftp_mkdir_all(relative_parent.to_string_lossy().as_ref())
                .await
                .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
        }

        // Absolute path for the actual open — SFTP accepts absolute paths
        // within its own root (spec §4.6).
        session
            .sftp_write(p.to_string_lossy().as_ref(), data)
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let old_p = self.validator.validate(old)?;
        let new_p = self.validator.validate(new)?;
        let session = self.ensure_connected().await?;
        session
            .sftp_rename(old_p.to_string_lossy().as_ref(), new_p.to_string_lossy().as_ref())
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))
    }

    async fn rm(&self, path: &str, opts: RmOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let mut flags = String::from("-");
        if opts.recursive {
            flags.push('r');
        }
        if opts.force {
            flags.push('f');
        }
        let cmd = if flags == "-" {
            format!("rm {}", shell_quote(&p))
        } else {
            format!("rm {flags} {}", shell_quote(&p))
        };
        let session = self.ensure_connected().await?;
        let output = session
            .run(&cmd)
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
        if output.returncode != 0 && !opts.force {
            return Err(BackendError::WriteFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let session = self.ensure_connected().await?;
        let mut names = session
            .sftp_read_dir(p.to_string_lossy().as_ref())
            .await
            .map_err(|e| BackendError::LsFailed(e.to_string()))?;
        names.sort();
        Ok(names)
    }

    async fn mkdir(&self, path: &str, opts: MkdirOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let session = self.ensure_connected().await?;
        let relative = relative_for_sftp(self.validator.root(), &p);
        let relative = relative.to_string_lossy();
        if opts.recursive {
            session
                .sftp_mkdir_all(relative.as_ref())
                .await
                .map_err(|e| BackendError::WriteFailed(e.to_string()))
        } else {
            session
                .sftp_mkdir(relative.as_ref())
                .await
                .map_err(|e| BackendError::WriteFailed(e.to_string()))
        }
    }

    async fn touch(&self, path: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let cmd = format!("touch {}", shell_quote(&p));
        let session = self.ensure_connected().await?;
        let output = session
            .run(&cmd)
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
        if output.returncode != 0 {
            return Err(BackendError::WriteFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let cmd = format!("test -e {}", shell_quote(&p));
        let session = self.ensure_connected().await?;
        let output = session
            .run(&cmd)
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        Ok(output.returncode == 0)
    }

    async fn stat(&self, path: &str) -> Result<FileStat, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let session = self.ensure_connected().await?;
        let meta = session
            .sftp_metadata(p.to_string_lossy().as_ref())
            .await
            .map_err(|e| BackendError::ReadFailed(e.to_string()))?;
        Ok(FileStat {
            is_file: meta.is_file,
            is_directory: meta.is_dir,
            size: meta.size,
            modified: meta.modified,
        })
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reconnect.cancel();
        self.children.destroy_all().await;
        for closeable in self.closeables.lock().drain(..) {
            closeable.close().await;
        }
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.status.destroy();
    }

    fn register_scoped_child(&self, child: Arc<ScopedBackend>) {
        let id = self.children.next_id();
        child.set_registry_id(id);
        self.children.register(id, child);
    }

    fn unregister_scoped_child(&self, id: u64) {
        self.children.unregister(id);
    }
}

/// Single-quote a path for inclusion in a remote shell command.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_command_framing_matches_spec() {
        let line = build_exec_line("/var/workspace", &BTreeMap::new(), "echo hello");
        assert!(line.starts_with("cd /var/workspace && HOME=/var/workspace "));
        assert!(line.contains("echo hello"));
    }

    #[test]
    fn exec_command_framing_includes_env() {
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let line = build_exec_line("/var/workspace", &env, "run.sh");
        assert_eq!(line, "cd /var/workspace && HOME=/var/workspace FOO=bar run.sh");
    }

    #[test]
    fn write_chroot_invariant_sub_directory() {
        let root = Path::new("/var/workspace");
        let absolute = PathValidator::posix(root.to_string_lossy().to_string())
            .validate("sub/file.txt")
            .unwrap();
        let relative = relative_parent_for_sftp(root, &absolute);
        assert_eq!(relative, Some(PathBuf::from("sub")));
    }

    #[test]
    fn write_chroot_invariant_root_file_has_no_makedirs_call() {
        let root = Path::new("/var/workspace");
        let absolute = PathValidator::posix(root.to_string_lossy().to_string())
            .validate("test.txt")
            .unwrap();
        assert_eq!(relative_parent_for_sftp(root, &absolute), None);
    }

    #[test]
    fn write_chroot_invariant_deep_path() {
        let root = Path::new("/var/workspace");
        let absolute = PathValidator::posix(root.to_string_lossy().to_string())
            .validate("a/b/c/file.txt")
            .unwrap();
        assert_eq!(
            relative_parent_for_sftp(root, &absolute),
            Some(PathBuf::from("a/b/c"))
        );
        assert_eq!(absolute, PathBuf::from("/var/workspace/a/b/c/file.txt"));
    }

    #[test]
    fn mkdir_chroot_invariant() {
        let root = Path::new("/var/workspace");
        let absolute = PathValidator::posix(root.to_string_lossy().to_string())
            .validate("sub/dir")
            .unwrap();
        assert_eq!(relative_for_sftp(root, &absolute), PathBuf::from("sub/dir"));
    }

    #[test]
    fn truncation_sentinel_when_over_limit() {
        let stdout = "x".repeat(5000);
        let (text, truncated) = truncate_output(&stdout, Some(1000));
        assert!(truncated);
        assert!(text.len() < 5000);
        assert!(text.contains("original length 5000 bytes"));
    }

    #[test]
    fn no_truncation_under_limit() {
        let (text, truncated) = truncate_output("short", Some(1000));
        assert_eq!(text, "short");
        assert!(!truncated);
    }

    #[test]
    fn zero_max_output_length_disables_truncation() {
        let stdout = "x".repeat(5000);
        let (text, truncated) = truncate_output(&stdout, Some(0));
        assert_eq!(text.len(), 5000);
        assert!(!truncated);
    }
}
