//! In-memory backend that records every call

use crate::acl::{Grants, PermissionTable, ADMIN_USER};
use crate::backend::{
    async_trait, AclCalculator, Archiver, BackendError, CallContext, ComputedAcl, DirEntry, FileData,
    FileStore, HttpFetcher, HttpResponse, Messenger, SessionStore, StateStore,
};
use crate::patterns::{composite_key, Pattern, SubscriptionType};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Subscribe { kind: SubscriptionType, key: String },
    Unsubscribe { kind: SubscriptionType, key: String },
    GetState(String),
    GetStates(String),
    SetState(String),
    DelState(String),
    GetObject(String),
    GetObjects(String),
    SetObject(String),
    DelObject(String),
    GetObjectView(String),
    ReadFile(String),
    WriteFile(String),
    Unlink(String),
    Rename(String, String),
    Mkdir(String),
    ReadDir(String),
    FileExists(String),
    SessionGet(String),
    CalculatePermissions(String),
    SendTo { instance: String, command: String, message: Value },
    Request { instance: String, command: String },
    RequestHost { host: String, command: String },
    HttpGet(String),
    Archive(String),
}

impl BackendCall {
    /// True for state/object point and list calls
    pub fn is_store_access(&self) -> bool {
        matches!(
            self,
            BackendCall::GetState(_)
                | BackendCall::GetStates(_)
                | BackendCall::SetState(_)
                | BackendCall::DelState(_)
                | BackendCall::GetObject(_)
                | BackendCall::GetObjects(_)
                | BackendCall::SetObject(_)
                | BackendCall::DelObject(_)
                | BackendCall::GetObjectView(_)
        )
    }
}

#[derive(Default)]
struct FileTree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl FileTree {
    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files.keys().any(|k| k.starts_with(&prefix)) || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn file_key(adapter: &str, path: &str) -> String {
    format!("{}/{}", adapter, normalize_path(path))
}

/// In-process implementation of every collaborator trait
#[derive(Default)]
pub struct MemoryBackend {
    calls: Mutex<Vec<BackendCall>>,
    states: Mutex<BTreeMap<String, Value>>,
    objects: Mutex<BTreeMap<String, Value>>,
    files: Mutex<HashMap<String, FileTree>>,
    sessions: Mutex<HashMap<String, Value>>,
    users: Mutex<HashMap<String, ComputedAcl>>,
    instance_replies: Mutex<HashMap<(String, String), Value>>,
    host_replies: Mutex<HashMap<(String, String), Value>>,
    http_responses: Mutex<HashMap<String, HttpResponse>>,
    host_delay: Mutex<Option<Duration>>,
    session_delay: Mutex<Option<Duration>>,
    fail_subscriptions: AtomicBool,
    fail_sessions: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn subscribe_calls(&self, kind: SubscriptionType, key: &str) -> usize {
        self.count_calls(|c| matches!(c, BackendCall::Subscribe { kind: k, key: p } if *k == kind && p == key))
    }

    pub fn unsubscribe_calls(&self, kind: SubscriptionType, key: &str) -> usize {
        self.count_calls(|c| matches!(c, BackendCall::Unsubscribe { kind: k, key: p } if *k == kind && p == key))
    }

    pub fn store_calls(&self) -> usize {
        self.count_calls(BackendCall::is_store_access)
    }

    pub fn insert_state(&self, id: &str, state: Value) {
        self.states.lock().insert(id.to_string(), state);
    }

    pub fn state(&self, id: &str) -> Option<Value> {
        self.states.lock().get(id).cloned()
    }

    pub fn insert_object(&self, id: &str, obj: Value) {
        self.objects.lock().insert(id.to_string(), obj);
    }

    pub fn object(&self, id: &str) -> Option<Value> {
        self.objects.lock().get(id).cloned()
    }

    pub fn insert_file(&self, adapter: &str, path: &str, data: &[u8]) {
        self.files
            .lock()
            .entry(adapter.to_string())
            .or_default()
            .files
            .insert(normalize_path(path), data.to_vec());
    }

    pub fn has_file(&self, adapter: &str, path: &str) -> bool {
        self.files
            .lock()
            .get(adapter)
            .map(|t| t.files.contains_key(&normalize_path(path)))
            .unwrap_or(false)
    }

    pub fn has_dir(&self, adapter: &str, path: &str) -> bool {
        self.files
            .lock()
            .get(adapter)
            .map(|t| t.dirs.contains(&normalize_path(path)))
            .unwrap_or(false)
    }

    pub fn insert_session(&self, key: &str, record: Value) {
        self.sessions.lock().insert(key.to_string(), record);
    }

    pub fn remove_session(&self, key: &str) {
        self.sessions.lock().remove(key);
    }

    pub fn set_user(&self, user: &str, groups: Vec<String>, grants: Grants) {
        self.users
            .lock()
            .insert(user.to_string(), ComputedAcl { groups, grants });
    }

    pub fn set_instance_reply(&self, instance: &str, command: &str, reply: Value) {
        self.instance_replies
            .lock()
            .insert((instance.to_string(), command.to_string()), reply);
    }

    pub fn set_host_reply(&self, host: &str, command: &str, reply: Value) {
        self.host_replies
            .lock()
            .insert((host.to_string(), command.to_string()), reply);
    }

    pub fn set_host_delay(&self, delay: Option<Duration>) {
        *self.host_delay.lock() = delay;
    }

    pub fn set_session_delay(&self, delay: Option<Duration>) {
        *self.session_delay.lock() = delay;
    }

    pub fn set_http_response(&self, url: &str, response: HttpResponse) {
        self.http_responses.lock().insert(url.to_string(), response);
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    fn select(map: &BTreeMap<String, Value>, pattern: &str) -> Result<Map<String, Value>, BackendError> {
        let pattern = Pattern::compile(pattern).map_err(|e| BackendError::Failed(e.to_string()))?;
        Ok(map
            .iter()
            .filter(|(id, _)| pattern.matches(id))
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect())
    }
}

#[async_trait]
impl StateStore for MemoryBackend {
    async fn subscribe(
        &self,
        kind: SubscriptionType,
        pattern: &str,
        aux: Option<&str>,
        _ctx: &CallContext,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Subscribe {
            kind,
            key: composite_key(pattern, aux),
        });
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable);
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        kind: SubscriptionType,
        pattern: &str,
        aux: Option<&str>,
        _ctx: &CallContext,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Unsubscribe {
            kind,
            key: composite_key(pattern, aux),
        });
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable);
        }
        Ok(())
    }

    async fn get_state(&self, id: &str, _ctx: &CallContext) -> Result<Option<Value>, BackendError> {
        self.record(BackendCall::GetState(id.to_string()));
        Ok(self.state(id))
    }

    async fn get_states(&self, pattern: &str, _ctx: &CallContext) -> Result<Map<String, Value>, BackendError> {
        self.record(BackendCall::GetStates(pattern.to_string()));
        Self::select(&self.states.lock(), pattern)
    }

    async fn set_state(&self, id: &str, state: Value, _ctx: &CallContext) -> Result<(), BackendError> {
        self.record(BackendCall::SetState(id.to_string()));
        self.insert_state(id, state);
        Ok(())
    }

    async fn del_state(&self, id: &str, _ctx: &CallContext) -> Result<(), BackendError> {
        self.record(BackendCall::DelState(id.to_string()));
        match self.states.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotExists(id.to_string())),
        }
    }

    async fn get_object(&self, id: &str, _ctx: &CallContext) -> Result<Option<Value>, BackendError> {
        self.record(BackendCall::GetObject(id.to_string()));
        Ok(self.object(id))
    }

    async fn get_objects(&self, pattern: &str, _ctx: &CallContext) -> Result<Map<String, Value>, BackendError> {
        self.record(BackendCall::GetObjects(pattern.to_string()));
        Self::select(&self.objects.lock(), pattern)
    }

    async fn set_object(&self, id: &str, obj: Value, _ctx: &CallContext) -> Result<(), BackendError> {
        self.record(BackendCall::SetObject(id.to_string()));
        self.insert_object(id, obj);
        Ok(())
    }

    async fn del_object(&self, id: &str, _ctx: &CallContext) -> Result<(), BackendError> {
        self.record(BackendCall::DelObject(id.to_string()));
        match self.objects.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotExists(id.to_string())),
        }
    }

    async fn get_object_view(
        &self,
        design: &str,
        search: &str,
        params: Value,
        _ctx: &CallContext,
    ) -> Result<Value, BackendError> {
        self.record(BackendCall::GetObjectView(format!("{}/{}", design, search)));
        let start = params.get("startkey").and_then(Value::as_str).unwrap_or("");
        let end = params.get("endkey").and_then(Value::as_str).unwrap_or("\u{9999}");
        let rows: Vec<Value> = self
            .objects
            .lock()
            .iter()
            .filter(|(id, obj)| {
                id.as_str() >= start
                    && id.as_str() <= end
                    && obj.get("type").and_then(Value::as_str) == Some(search)
            })
            .map(|(id, obj)| serde_json::json!({ "id": id, "value": obj }))
            .collect();
        Ok(serde_json::json!({ "rows": rows }))
    }
}

#[async_trait]
impl FileStore for MemoryBackend {
    async fn read_file(&self, adapter: &str, path: &str, _ctx: &CallContext) -> Result<FileData, BackendError> {
        self.record(BackendCall::ReadFile(file_key(adapter, path)));
        let files = self.files.lock();
        let data = files
            .get(adapter)
            .and_then(|t| t.files.get(&normalize_path(path)))
            .cloned()
            .ok_or_else(|| BackendError::NotExists(file_key(adapter, path)))?;
        let mime_type = if path.ends_with(".json") {
            Some("application/json".to_string())
        } else {
            None
        };
        Ok(FileData { data, mime_type })
    }

    async fn write_file(
        &self,
        adapter: &str,
        path: &str,
        data: Vec<u8>,
        _ctx: &CallContext,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::WriteFile(file_key(adapter, path)));
        self.insert_file(adapter, path, &data);
        Ok(())
    }

    async fn unlink(&self, adapter: &str, path: &str, _ctx: &CallContext) -> Result<(), BackendError> {
        self.record(BackendCall::Unlink(file_key(adapter, path)));
        let mut files = self.files.lock();
        let tree = files
            .get_mut(adapter)
            .ok_or_else(|| BackendError::NotExists(file_key(adapter, path)))?;
        let path = normalize_path(path);
        if tree.files.remove(&path).is_some() || tree.dirs.remove(&path) {
            Ok(())
        } else {
            Err(BackendError::NotExists(file_key(adapter, &path)))
        }
    }

    async fn rename(
        &self,
        adapter: &str,
        old_path: &str,
        new_path: &str,
        _ctx: &CallContext,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Rename(file_key(adapter, old_path), file_key(adapter, new_path)));
        let mut files = self.files.lock();
        let tree = files
            .get_mut(adapter)
            .ok_or_else(|| BackendError::NotExists(file_key(adapter, old_path)))?;
        let (old_path, new_path) = (normalize_path(old_path), normalize_path(new_path));
        if let Some(data) = tree.files.remove(&old_path) {
            tree.files.insert(new_path, data);
            Ok(())
        } else if tree.dirs.remove(&old_path) {
            tree.dirs.insert(new_path);
            Ok(())
        } else {
            Err(BackendError::NotExists(file_key(adapter, &old_path)))
        }
    }

    async fn mkdir(&self, adapter: &str, path: &str, _ctx: &CallContext) -> Result<(), BackendError> {
        self.record(BackendCall::Mkdir(file_key(adapter, path)));
        self.files
            .lock()
            .entry(adapter.to_string())
            .or_default()
            .dirs
            .insert(normalize_path(path));
        Ok(())
    }

    async fn read_dir(&self, adapter: &str, path: &str, _ctx: &CallContext) -> Result<Vec<DirEntry>, BackendError> {
        self.record(BackendCall::ReadDir(file_key(adapter, path)));
        let files = self.files.lock();
        let path = normalize_path(path);
        let tree = match files.get(adapter) {
            Some(tree) if tree.is_dir(&path) => tree,
            _ => return Err(BackendError::NotExists(file_key(adapter, &path))),
        };

        let prefix = if path.is_empty() { String::new() } else { format!("{}/", path) };
        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();
        for (key, data) in tree.files.iter() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        entries.entry(dir.to_string()).or_insert(DirEntry {
                            file: dir.to_string(),
                            is_dir: true,
                            size: 0,
                        });
                    }
                    None => {
                        entries.insert(
                            rest.to_string(),
                            DirEntry {
                                file: rest.to_string(),
                                is_dir: false,
                                size: data.len() as u64,
                            },
                        );
                    }
                }
            }
        }
        for dir in tree.dirs.iter() {
            if let Some(rest) = dir.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() {
                    entries.entry(name.to_string()).or_insert(DirEntry {
                        file: name.to_string(),
                        is_dir: true,
                        size: 0,
                    });
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    async fn file_exists(&self, adapter: &str, path: &str, _ctx: &CallContext) -> Result<bool, BackendError> {
        self.record(BackendCall::FileExists(file_key(adapter, path)));
        Ok(self.has_file(adapter, path))
    }
}

#[async_trait]
impl SessionStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.record(BackendCall::SessionGet(key.to_string()));
        let delay = *self.session_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable);
        }
        Ok(self.sessions.lock().get(key).cloned())
    }
}

#[async_trait]
impl AclCalculator for MemoryBackend {
    async fn calculate_permissions(&self, user: &str, _table: &PermissionTable) -> Result<ComputedAcl, BackendError> {
        self.record(BackendCall::CalculatePermissions(user.to_string()));
        if let Some(acl) = self.users.lock().get(user) {
            return Ok(acl.clone());
        }
        if user == ADMIN_USER {
            return Ok(ComputedAcl {
                groups: vec!["system.group.administrator".to_string()],
                grants: Grants::all(),
            });
        }
        Ok(ComputedAcl::default())
    }
}

#[async_trait]
impl Messenger for MemoryBackend {
    async fn send_to(&self, instance: &str, command: &str, message: Value) -> Result<(), BackendError> {
        self.record(BackendCall::SendTo {
            instance: instance.to_string(),
            command: command.to_string(),
            message,
        });
        Ok(())
    }

    async fn request(&self, instance: &str, command: &str, _message: Value) -> Result<Value, BackendError> {
        self.record(BackendCall::Request {
            instance: instance.to_string(),
            command: command.to_string(),
        });
        let reply = self
            .instance_replies
            .lock()
            .get(&(instance.to_string(), command.to_string()))
            .cloned();
        Ok(reply.unwrap_or(Value::Null))
    }

    async fn request_host(&self, host: &str, command: &str, _message: Value) -> Result<Value, BackendError> {
        self.record(BackendCall::RequestHost {
            host: host.to_string(),
            command: command.to_string(),
        });
        let delay = *self.host_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.host_replies
            .lock()
            .get(&(host.to_string(), command.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::Failed(format!("host {} did not answer {}", host, command)))
    }
}

#[async_trait]
impl HttpFetcher for MemoryBackend {
    async fn get(&self, url: &str) -> Result<HttpResponse, BackendError> {
        self.record(BackendCall::HttpGet(url.to_string()));
        self.http_responses
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| BackendError::Failed(format!("no route to {}", url)))
    }
}

#[async_trait]
impl Archiver for MemoryBackend {
    /// Not a real ZIP: a JSON listing of `path -> size`, enough to exercise callers
    async fn archive_dir(&self, adapter: &str, path: &str, _ctx: &CallContext) -> Result<Vec<u8>, BackendError> {
        self.record(BackendCall::Archive(file_key(adapter, path)));
        let files = self.files.lock();
        let tree = files
            .get(adapter)
            .ok_or_else(|| BackendError::NotExists(file_key(adapter, path)))?;
        let prefix = normalize_path(path);
        let listing: BTreeMap<&String, usize> = tree
            .files
            .iter()
            .filter(|(k, _)| prefix.is_empty() || k.starts_with(&format!("{}/", prefix)))
            .map(|(k, v)| (k, v.len()))
            .collect();
        serde_json::to_vec(&listing).map_err(|e| BackendError::Failed(e.to_string()))
    }
}
