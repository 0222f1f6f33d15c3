//! In-memory backend.
//!
//! spec.md scopes the in-memory backend's *storage model* out of the core
//! ("specified only by the interface the core needs") — this is the
//! minimal, fully-functional leaf the core needs to dispatch against for
//! end-to-end exercise of path validation (C1), scoping (C7), and the MCP
//! surface (C8/C9). Command execution has no meaningful semantics without
//! a real process model, so `exec` always fails with `ExecFailed`; every
//! other verb is a real, working implementation over a `HashMap`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::scoped::ScopedBackend;
use super::{
    Backend, BackendKind, ChildRegistry, ExecContent, ExecOptions, ExecOutcome, FileStat,
    MkdirOptions, RmOptions,
};
use crate::error::BackendError;
use crate::path::PathValidator;

pub struct MemoryBackend {
    root: String,
    validator: PathValidator,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    children: ChildRegistry,
    destroyed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(root_dir: impl Into<String>) -> Self {
        let root = root_dir.into();
        Self {
            validator: PathValidator::posix(root.clone()),
            root,
            files: Mutex::new(HashMap::new()),
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

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn root_dir(&self) -> &str {
        &self.root
    }

    async fn exec(&self, cmd: &str, _opts: ExecOptions) -> Result<ExecOutcome, BackendError> {
        self.check_alive()?;
        if cmd.trim().is_empty() {
            return Err(BackendError::EmptyCommand);
        }
        Err(BackendError::ExecFailed {
            code: Some(127),
            stderr: "command execution is not supported on the memory backend".into(),
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        self.files
            .lock()
            .get(&p)
            .cloned()
            .ok_or_else(|| BackendError::ReadFailed(format!("no such file: {path}")))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        self.files.lock().insert(p, data.to_vec());
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let old_p = self.validator.validate(old)?;
        let new_p = self.validator.validate(new)?;
        let mut files = self.files.lock();
        let data = files
            .remove(&old_p)
            .ok_or_else(|| BackendError::WriteFailed(format!("no such file: {old}")))?;
        files.insert(new_p, data);
        Ok(())
    }

    async fn rm(&self, path: &str, opts: RmOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let mut files = self.files.lock();
        if opts.recursive {
            let prefix = p.clone();
            files.retain(|k, _| !(k == &prefix || k.starts_with(&prefix)));
        } else if files.remove(&p).is_none() && !opts.force {
            return Err(BackendError::WriteFailed(format!("no such file: {path}")));
        }
        Ok(())
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&p).ok()?;
                rest.components().next().map(|c| c.as_os_str().to_string_lossy().to_string())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn mkdir(&self, _path: &str, _opts: MkdirOptions) -> Result<(), BackendError> {
        self.check_alive()?;
        // Directories are implicit in the key-prefix model; nothing to do.
        Ok(())
    }

    async fn touch(&self, path: &str) -> Result<(), BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        self.files.lock().entry(p).or_insert_with(Vec::new);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let files = self.files.lock();
        Ok(files.contains_key(&p) || files.keys().any(|k| k.starts_with(&p) && k != &p))
    }

    async fn stat(&self, path: &str) -> Result<FileStat, BackendError> {
        self.check_alive()?;
        let p = self.validator.validate(path)?;
        let files = self.files.lock();
        if let Some(data) = files.get(&p) {
            return Ok(FileStat {
                is_file: true,
                is_directory: false,
                size: data.len() as u64,
                modified: Self::now(),
            });
        }
        if files.keys().any(|k| k.starts_with(&p) && k != &p) {
            return Ok(FileStat { is_file: false, is_directory: true, size: 0, modified: Self::now() });
        }
        Err(BackendError::ReadFailed(format!("no such path: {path}")))
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.children.destroy_all().await;
        self.files.lock().clear();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let be = MemoryBackend::new("/ws");
        be.write("a.txt", b"hello").await.unwrap();
        assert_eq!(be.read("a.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn readdir_lists_immediate_children() {
        let be = MemoryBackend::new("/ws");
        be.write("dir/a.txt", b"1").await.unwrap();
        be.write("dir/b.txt", b"2").await.unwrap();
        be.write("dir/sub/c.txt", b"3").await.unwrap();
        let mut names = be.readdir("dir").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string(), "sub".to_string()]);
    }

    #[tokio::test]
    async fn destroy_blocks_further_operations() {
        let be = MemoryBackend::new("/ws");
        be.destroy().await;
        assert!(matches!(
            be.write("a.txt", b"x").await,
            Err(BackendError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn path_escape_is_rejected_before_any_write() {
        let be = MemoryBackend::new("/ws");
        assert!(matches!(
            be.write("../escape.txt", b"x").await,
            Err(BackendError::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn exec_is_unsupported() {
        let be = MemoryBackend::new("/ws");
        assert!(matches!(
            be.exec("echo hi", ExecOptions::default()).await,
            Err(BackendError::ExecFailed { .. })
        ));
    }
}
