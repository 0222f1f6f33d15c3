//! A sub-root view over a parent backend (spec §4.7).
//!
//! Grounded on the teacher's `SandboxHandle` composition pattern where a
//! higher-level handle wraps a lower one and narrows its surface — here
//! narrowed to a path prefix instead of a capability set. The back-reference
//! shape (parent holds children strongly, child holds parent weakly) avoids
//! the reference cycle a naive "both sides strong" composition would create;
//! see `ChildRegistry` in `backend::mod`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    Backend, BackendKind, ChildRegistry, ExecOptions, ExecOutcome, FileStat, MkdirOptions,
    RmOptions,
};
use crate::error::BackendError;
use crate::path::PathValidator;

pub struct ScopedBackend {
    parent: Weak<dyn Backend>,
    scope_path: String,
    validator: PathValidator,
    children: ChildRegistry,
    registry_id: Mutex<Option<u64>>,
    destroyed: AtomicBool,
}

impl ScopedBackend {
    /// Create a scoped view rooted at `join(parent.root_dir(), scope_path)`.
    /// Registers itself with the parent's active-children set.
    pub fn new(parent: Arc<dyn Backend>, scope_path: impl Into<String>) -> Result<Arc<Self>, BackendError> {
        let scope_path = scope_path.into();
        let parent_validator = PathValidator::posix(parent.root_dir().to_string());
        let effective_root = parent_validator.validate(&scope_path)?;

        let scoped = Arc::new(Self {
            parent: Arc::downgrade(&parent),
            scope_path,
            validator: PathValidator::posix(effective_root.to_string_lossy().to_string()),
            children: ChildRegistry::new(),
            registry_id: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        parent.register_scoped_child(scoped.clone());
        Ok(scoped)
    }

    pub(crate) fn set_registry_id(&self, id: u64) {
        *self.registry_id.lock() = Some(id);
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionClosed);
        }
        Ok(())
    }

    fn parent(&self) -> Result<Arc<dyn Backend>, BackendError> {
        self.parent.upgrade().ok_or(BackendError::ConnectionClosed)
    }

    /// Rule 2 of spec §4.7: translate a path already validated against this
    /// scope's effective root into one relative to the parent's own root,
    /// which the parent re-validates independently.
    fn to_parent_path(&self, validated: &Path) -> String {
        let relative = validated.strip_prefix(self.validator.root()).unwrap_or(validated);
        let relative = relative.to_string_lossy();
        let scope = self.scope_path.trim_end_matches('/');
        if relative.is_empty() {
            scope.to_string()
        } else if scope.is_empty() || scope == "." {
            relative.into_owned()
        } else {
            format!("{scope}/{relative}")
        }
    }

    fn translate(&self, path: &str) -> Result<String, BackendError> {
        let validated = self.validator.validate(path)?;
        Ok(self.to_parent_path(&validated))
    }
}

#[async_trait]
impl Backend for ScopedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteFilesystem
    }

    fn root_dir(&self) -> &str {
        // Stable string view of the effective root for descriptor
        // construction (spec §4.8's `root_dir`/`X-Root-Dir`).
        self.validator.root().to_str().unwrap_or_default()
    }

    async fn exec(&self, cmd: &str, mut opts: ExecOptions) -> Result<ExecOutcome, BackendError> {
        self.check_alive()?;
        if let Some(cwd) = opts.cwd.take() {
            opts.cwd = Some(self.translate(&cwd)?);
        }
        self.parent()?.exec(cmd, opts).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.read(&forwarded).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.write(&forwarded, data).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let old_f = self.translate(old)?;
        let new_f = self.translate(new)?;
        self.parent()?.rename(&old_f, &new_f).await
    }

    async fn rm(&self, path: &str, opts: RmOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.rm(&forwarded, opts).await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.readdir(&forwarded).await
    }

    async fn mkdir(&self, path: &str, opts: MkdirOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.mkdir(&forwarded, opts).await
    }

    async fn touch(&self, path: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.touch(&forwarded).await
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.exists(&forwarded).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat, BackendError> {
        self.check_alive()?;
        let forwarded = self.translate(path)?;
        self.parent()?.stat(&forwarded).await
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.children.destroy_all().await;
        if let Some(id) = self.registry_id.lock().take() {
            if let Ok(parent) = self.parent() {
                parent.unregister_scoped_child(id);
            }
        }
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
