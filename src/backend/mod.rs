//! The uniform filesystem + exec surface every backend implementation
//! exposes (spec §3 Data Model, §4.6). Not a named component in spec.md's
//! component table, but required to express "transparently dispatches to
//! one of three implementations" — grounded on the teacher's
//! `sandbox::handle::SandboxHandle` trait, same shape (exec + file verbs +
//! lifecycle), generalised to the three backend kinds this spec names.

pub mod local;
pub mod memory;
pub mod remote;
pub mod scoped;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BackendError;
use scoped::ScopedBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    LocalFilesystem,
    RemoteFilesystem,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub encoding: Encoding,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Text,
    Buffer,
}

#[derive(Debug, Clone)]
pub enum ExecContent {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: ExecContent,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RmOptions {
    pub recursive: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MkdirOptions {
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub is_file: bool,
    pub is_directory: bool,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

/// A file-and-exec surface over some implementation: in-memory, local
/// filesystem, or a remote daemon. Every operation validates its path (C1)
/// before touching anything, and fails with `ConnectionClosed` once the
/// owning backend has been destroyed (spec §3).
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn root_dir(&self) -> &str;

    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecOutcome, BackendError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), BackendError>;
    async fn rename(&self, old: &str, new: &str) -> Result<(), BackendError>;
    async fn rm(&self, path: &str, opts: RmOptions) -> Result<(), BackendError>;
    async fn readdir(&self, path: &str) -> Result<Vec<String>, BackendError>;
    async fn mkdir(&self, path: &str, opts: MkdirOptions) -> Result<(), BackendError>;
    async fn touch(&self, path: &str) -> Result<(), BackendError>;
    async fn exists(&self, path: &str) -> Result<bool, BackendError>;
    async fn stat(&self, path: &str) -> Result<FileStat, BackendError>;

    /// Destroy this backend. Idempotent; always succeeds.
    async fn destroy(&self);

    /// Track a scoped child created over this backend (spec §4.7). The
    /// parent holds this strongly; the child's own reference back to the
    /// parent is a `Weak`, so the pair never forms a cycle. Backends that
    /// never get scoped (none currently) may leave the default no-op.
    fn register_scoped_child(&self, _child: Arc<ScopedBackend>) {}

    /// Remove a scoped child from the active-children set, e.g. when the
    /// child destroys itself directly rather than via the parent.
    fn unregister_scoped_child(&self, _id: u64) {}
}

/// Shared bookkeeping for a backend's active scoped children (spec §3
/// "Scoped backend" invariants, §4.7). Generates ids and holds the strong
/// references the parent owns; `destroy_all` is called once from the
/// parent's own `destroy`.
#[derive(Default)]
pub struct ChildRegistry {
    next_id: AtomicU64,
    children: Mutex<Vec<(u64, Arc<ScopedBackend>)>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(0), children: Mutex::new(Vec::new()) }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, id: u64, child: Arc<ScopedBackend>) {
        self.children.lock().push((id, child));
    }

    pub fn unregister(&self, id: u64) {
        self.children.lock().retain(|(cid, _)| *cid != id);
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub async fn destroy_all(&self) {
        let drained: Vec<Arc<ScopedBackend>> =
            self.children.lock().drain(..).map(|(_, c)| c).collect();
        for child in drained {
            child.destroy().await;
        }
    }
}
