//! Command permission table

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Resource class a command touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Object,
    State,
    File,
    Users,
    Other,
    /// Always allowed once authenticated
    #[serde(rename = "")]
    Any,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Object => "object",
            ResourceType::State => "state",
            ResourceType::File => "file",
            ResourceType::Users => "users",
            ResourceType::Other => "other",
            ResourceType::Any => "",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Read,
    Write,
    Create,
    Delete,
    Execute,
    Http,
    Sendto,
    #[serde(rename = "")]
    None,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Execute => "execute",
            Operation::Http => "http",
            Operation::Sendto => "sendto",
            Operation::None => "",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a command needs from the caller's ACL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDescriptor {
    #[serde(rename = "type")]
    pub resource: ResourceType,
    pub operation: Operation,
}

impl PermissionDescriptor {
    pub const fn new(resource: ResourceType, operation: Operation) -> Self {
        Self { resource, operation }
    }

    /// Descriptor for commands any authenticated caller may use
    pub const fn open() -> Self {
        Self::new(ResourceType::Any, Operation::None)
    }

    pub fn is_open(&self) -> bool {
        self.resource == ResourceType::Any
    }
}

use Operation as Op;
use ResourceType as Rt;

const COMMAND_PERMISSIONS: &[(&str, ResourceType, Operation)] = &[
    ("getObject", Rt::Object, Op::Read),
    ("getObjects", Rt::Object, Op::List),
    ("getObjectView", Rt::Object, Op::List),
    ("getForeignObjects", Rt::Object, Op::List),
    ("setObject", Rt::Object, Op::Write),
    ("extendObject", Rt::Object, Op::Write),
    ("delObject", Rt::Object, Op::Delete),
    ("requireLog", Rt::Object, Op::Write),
    ("getHostByIp", Rt::Object, Op::List),
    ("subscribeObjects", Rt::Object, Op::Read),
    ("unsubscribeObjects", Rt::Object, Op::Read),
    ("getUserPermissions", Rt::Object, Op::Read),
    ("subscribeFiles", Rt::Object, Op::Read),
    ("unsubscribeFiles", Rt::Object, Op::Read),
    ("getStates", Rt::State, Op::List),
    ("getForeignStates", Rt::State, Op::List),
    ("getState", Rt::State, Op::Read),
    ("setState", Rt::State, Op::Write),
    ("delState", Rt::State, Op::Delete),
    ("createState", Rt::State, Op::Create),
    ("subscribe", Rt::State, Op::Read),
    ("unsubscribe", Rt::State, Op::Read),
    ("getStateHistory", Rt::State, Op::Read),
    ("addUser", Rt::Users, Op::Create),
    ("delUser", Rt::Users, Op::Delete),
    ("addGroup", Rt::Users, Op::Create),
    ("delGroup", Rt::Users, Op::Delete),
    ("changePassword", Rt::Users, Op::Write),
    ("httpGet", Rt::Other, Op::Http),
    ("cmdExec", Rt::Other, Op::Execute),
    ("readLogs", Rt::Other, Op::Execute),
    ("sendTo", Rt::Other, Op::Sendto),
    ("sendToHost", Rt::Other, Op::Sendto),
    ("clientSubscribe", Rt::Other, Op::Sendto),
    ("clientUnsubscribe", Rt::Other, Op::Sendto),
    ("readDir", Rt::File, Op::List),
    ("createFile", Rt::File, Op::Create),
    ("writeFile", Rt::File, Op::Write),
    ("writeFile64", Rt::File, Op::Write),
    ("readFile", Rt::File, Op::Read),
    ("readFile64", Rt::File, Op::Read),
    ("fileExists", Rt::File, Op::Read),
    ("readDirAsZip", Rt::File, Op::Read),
    ("deleteFile", Rt::File, Op::Delete),
    ("unlink", Rt::File, Op::Delete),
    ("deleteFolder", Rt::File, Op::Delete),
    ("rename", Rt::File, Op::Write),
    ("renameFile", Rt::File, Op::Write),
    ("mkdir", Rt::File, Op::Write),
    ("chmodFile", Rt::File, Op::Write),
    ("chownFile", Rt::File, Op::Write),
    ("authenticate", Rt::Any, Op::None),
    ("authEnabled", Rt::Any, Op::None),
    ("getVersion", Rt::Any, Op::None),
    ("getAdapterName", Rt::Any, Op::None),
    ("listPermissions", Rt::Any, Op::None),
    ("name", Rt::Any, Op::None),
    ("disconnect", Rt::Any, Op::None),
    ("logout", Rt::Any, Op::None),
    ("checkFeatureSupported", Rt::Any, Op::None),
    ("getCurrentInstance", Rt::Any, Op::None),
];

/// Immutable command name -> descriptor map
#[derive(Debug, Clone)]
pub struct PermissionTable {
    entries: HashMap<String, PermissionDescriptor>,
}

impl PermissionTable {
    /// The canonical protocol table
    pub fn standard() -> Self {
        let entries = COMMAND_PERMISSIONS
            .iter()
            .map(|(name, resource, operation)| {
                (name.to_string(), PermissionDescriptor::new(*resource, *operation))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, command: &str) -> Option<PermissionDescriptor> {
        self.entries.get(command).copied()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.entries.contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PermissionDescriptor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `{command: {type, operation}}`, as answered by `listPermissions`
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(name, d)| {
                (
                    name.clone(),
                    serde_json::json!({ "type": d.resource.as_str(), "operation": d.operation.as_str() }),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl Default for PermissionTable {
    fn default() -> Self {
        Self::standard()
    }
}
