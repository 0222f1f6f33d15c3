//! Local-filesystem backend: every path is validated (C1) against
//! `root_dir`, then the operation is issued directly against the OS.
//!
//! spec.md scopes the local backend's "direct OS calls" out of the core's
//! detailed design, so this is a thin, fully-working adapter from `Backend`
//! onto `tokio::fs`, grounded on `FsJail`'s operation set
//! (`put_file`/`get_file`/`read_dir`/`remove_path`) — the teacher's
//! equivalent best-effort local jail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::scoped::ScopedBackend;
use super::{
    Backend, BackendKind, ChildRegistry, ExecContent, ExecOptions, ExecOutcome, FileStat,
    MkdirOptions, RmOptions,
};
use crate::error::BackendError;
use crate::path::PathValidator;

pub struct LocalBackend {
    root: String,
    validator: PathValidator,
    children: ChildRegistry,
    destroyed: AtomicBool,
}

impl LocalBackend {
    pub fn new(root_dir: impl Into<String>) -> Self {
        let root = root_dir.into();
        Self {
            validator: PathValidator::new(root.clone()),
            root,
            children: ChildRegistry::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalFilesystem
    }

    fn root_dir(&self) -> &str {
        &self.root
    }

    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecOutcome, BackendError> {
        self.check_alive()?;
        if cmd.trim().is_empty() {
            return Err(BackendError::EmptyCommand);
        }
        let cwd = opts.cwd.clone().unwrap_or_else(|| self.root.clone());
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(&cwd).env("HOME", &cwd);
        for (k, v) in &opts.env {
            command.env(k, v);
        }
        let output = command
            .output()
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(BackendError::ExecFailed { code: Some(exit_code), stderr });
        }
        let stdout = match opts.encoding {
            super::Encoding::Text => ExecContent::Text(String::from_utf8_lossy(&output.stdout).into_owned()),
            super::Encoding::Buffer => ExecContent::Bytes(output.stdout),
        };
        Ok(ExecOutcome { stdout, stderr, exit_code })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        tokio::fs::read(&p).await.map_err(|e| BackendError::ReadFailed(e.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        if let Some(parent) = p.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
        }
        tokio::fs::write(&p, data).await.map_err(|e| BackendError::WriteFailed(e.to_string()))
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let old_p = self.validator.validate(old)?;
        let new_p = self.validator.validate(new)?;
        tokio::fs::rename(&old_p, &new_p)
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))
    }

    async fn rm(&self, path: &str, opts: RmOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let result = if p.is_dir() {
            if opts.recursive {
                tokio::fs::remove_dir_all(&p).await
            } else {
                tokio::fs::remove_dir(&p).await
            }
        } else {
            tokio::fs::remove_file(&p).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(_) if opts.force => Ok(()),
            Err(e) => Err(BackendError::WriteFailed(e.to_string())),
        }
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let mut entries = tokio::fs::read_dir(&p)
            .await
            .map_err(|e| BackendError::LsFailed(e.to_string()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::LsFailed(e.to_string()))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn mkdir(&self, path: &str, opts: MkdirOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let result = if opts.recursive {
            tokio::fs::create_dir_all(&p).await
        } else {
            tokio::fs::create_dir(&p).await
        };
        result.map_err(|e| BackendError::WriteFailed(e.to_string()))
    }

    async fn touch(&self, path: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        if tokio::fs::try_exists(&p).await.unwrap_or(false) {
            let now = std::time::SystemTime::now();
            let file = tokio::fs::File::open(&p)
                .await
                .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
            file.set_modified(now).await.map_err(|e| BackendError::WriteFailed(e.to_string()))
        } else {
            tokio::fs::write(&p, b"").await.map_err(|e| BackendError::WriteFailed(e.to_string()))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        Ok(tokio::fs::try_exists(&p).await.unwrap_or(false))
    }

    async fn stat(&self, path: &str) -> Result<FileStat, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let meta = tokio::fs::metadata(&p).await.map_err(|e| BackendError::ReadFailed(e.to_string()))?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(FileStat { is_file: meta.is_file(), is_directory: meta.is_dir(), size: meta.len(), modified })
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.children.destroy_all().await;
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
