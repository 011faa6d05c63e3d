//! Collaborator interfaces
//!
//! The gateway never owns data. Everything it reads or writes goes through
//! these traits:
//! - `StateStore`: states, objects and pattern subscriptions
//! - `FileStore`: per-adapter file tree
//! - `SessionStore`: session/token records for authentication
//! - `AclCalculator`: grants for a user
//! - `Messenger`: messages to named instances and hosts
//! - `HttpFetcher`, `Archiver`: injected I/O capabilities
//!
//! `MemoryBackend` implements all of them in-process.

mod memory;

pub use memory::{BackendCall, MemoryBackend};

use crate::acl::{Grants, PermissionTable};
use crate::patterns::SubscriptionType;
pub use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Backend errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Path or id does not exist; carries the path for logging
    #[error("Not exists")]
    NotExists(String),

    #[error("{0}")]
    Failed(String),

    #[error("backend unavailable")]
    Unavailable,
}

impl BackendError {
    pub fn is_not_exists(&self) -> bool {
        matches!(self, BackendError::NotExists(_))
    }
}

/// Identity a backend call is made on behalf of
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub user: String,
}

impl CallContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub file: String,
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Result of computing a user's permissions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedAcl {
    pub groups: Vec<String>,
    pub grants: Grants,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Start forwarding changes matching `pattern` (and `aux` for files)
    async fn subscribe(
        &self,
        kind: SubscriptionType,
        pattern: &str,
        aux: Option<&str>,
        ctx: &CallContext,
    ) -> Result<(), BackendError>;

    async fn unsubscribe(
        &self,
        kind: SubscriptionType,
        pattern: &str,
        aux: Option<&str>,
        ctx: &CallContext,
    ) -> Result<(), BackendError>;

    async fn get_state(&self, id: &str, ctx: &CallContext) -> Result<Option<Value>, BackendError>;

    async fn get_states(&self, pattern: &str, ctx: &CallContext) -> Result<Map<String, Value>, BackendError>;

    async fn set_state(&self, id: &str, state: Value, ctx: &CallContext) -> Result<(), BackendError>;

    async fn del_state(&self, id: &str, ctx: &CallContext) -> Result<(), BackendError>;

    async fn get_object(&self, id: &str, ctx: &CallContext) -> Result<Option<Value>, BackendError>;

    async fn get_objects(&self, pattern: &str, ctx: &CallContext) -> Result<Map<String, Value>, BackendError>;

    async fn set_object(&self, id: &str, obj: Value, ctx: &CallContext) -> Result<(), BackendError>;

    async fn del_object(&self, id: &str, ctx: &CallContext) -> Result<(), BackendError>;

    async fn get_object_view(
        &self,
        design: &str,
        search: &str,
        params: Value,
        ctx: &CallContext,
    ) -> Result<Value, BackendError>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_file(&self, adapter: &str, path: &str, ctx: &CallContext) -> Result<FileData, BackendError>;

    async fn write_file(
        &self,
        adapter: &str,
        path: &str,
        data: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<(), BackendError>;

    async fn unlink(&self, adapter: &str, path: &str, ctx: &CallContext) -> Result<(), BackendError>;

    async fn rename(
        &self,
        adapter: &str,
        old_path: &str,
        new_path: &str,
        ctx: &CallContext,
    ) -> Result<(), BackendError>;

    async fn mkdir(&self, adapter: &str, path: &str, ctx: &CallContext) -> Result<(), BackendError>;

    /// List a folder. Fails with `NotExists` when `path` is a file.
    async fn read_dir(&self, adapter: &str, path: &str, ctx: &CallContext) -> Result<Vec<DirEntry>, BackendError>;

    async fn file_exists(&self, adapter: &str, path: &str, ctx: &CallContext) -> Result<bool, BackendError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session record by session id or `a:<token>`
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;
}

#[async_trait]
pub trait AclCalculator: Send + Sync {
    async fn calculate_permissions(&self, user: &str, table: &PermissionTable) -> Result<ComputedAcl, BackendError>;
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send without waiting for an answer
    async fn send_to(&self, instance: &str, command: &str, message: Value) -> Result<(), BackendError>;

    /// Send and wait for the instance's answer
    async fn request(&self, instance: &str, command: &str, message: Value) -> Result<Value, BackendError>;

    /// Host-scoped request
    async fn request_host(&self, host: &str, command: &str, message: Value) -> Result<Value, BackendError>;
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, BackendError>;
}

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Pack a folder of an adapter's file tree into a ZIP
    async fn archive_dir(&self, adapter: &str, path: &str, ctx: &CallContext) -> Result<Vec<u8>, BackendError>;
}

/// All collaborators, injected at construction
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn StateStore>,
    pub files: Arc<dyn FileStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub acl: Arc<dyn AclCalculator>,
    pub messenger: Arc<dyn Messenger>,
    pub http: Arc<dyn HttpFetcher>,
    pub archiver: Arc<dyn Archiver>,
}

impl Backend {
    /// Wire every collaborator to the same in-memory backend
    pub fn from_memory(memory: Arc<MemoryBackend>) -> Self {
        Self {
            store: memory.clone(),
            files: memory.clone(),
            sessions: memory.clone(),
            acl: memory.clone(),
            messenger: memory.clone(),
            http: memory.clone(),
            archiver: memory,
        }
    }
}
