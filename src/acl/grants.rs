//! Per-connection permission grants

use crate::acl::permissions::{Operation, PermissionDescriptor, ResourceType};
use serde::{Deserialize, Serialize};

/// List/read/write/create/delete flags for one resource class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpGrants {
    pub list: bool,
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
}

impl OpGrants {
    pub const fn all() -> Self {
        Self {
            list: true,
            read: true,
            write: true,
            create: true,
            delete: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            list: false,
            read: false,
            write: false,
            create: false,
            delete: false,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            list: true,
            read: true,
            write: false,
            create: false,
            delete: false,
        }
    }

    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::List => self.list,
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Create => self.create,
            Operation::Delete => self.delete,
            _ => false,
        }
    }

    /// Per-flag logical AND; the result never grants more than either side
    pub fn intersect(&self, other: &OpGrants) -> OpGrants {
        OpGrants {
            list: self.list && other.list,
            read: self.read && other.read,
            write: self.write && other.write,
            create: self.create && other.create,
            delete: self.delete && other.delete,
        }
    }
}

/// Grants outside the object/state/file/users classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtherGrants {
    pub execute: bool,
    pub http: bool,
    pub sendto: bool,
}

impl OtherGrants {
    pub const fn all() -> Self {
        Self {
            execute: true,
            http: true,
            sendto: true,
        }
    }

    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::Execute => self.execute,
            Operation::Http => self.http,
            Operation::Sendto => self.sendto,
            _ => false,
        }
    }
}

/// Full grant set computed for an identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grants {
    pub object: OpGrants,
    pub state: OpGrants,
    pub file: OpGrants,
    pub users: OpGrants,
    pub other: OtherGrants,
}

impl Grants {
    pub const fn all() -> Self {
        Self {
            object: OpGrants::all(),
            state: OpGrants::all(),
            file: OpGrants::all(),
            users: OpGrants::all(),
            other: OtherGrants::all(),
        }
    }

    pub fn allows(&self, resource: ResourceType, operation: Operation) -> bool {
        match resource {
            ResourceType::Object => self.object.allows(operation),
            ResourceType::State => self.state.allows(operation),
            ResourceType::File => self.file.allows(operation),
            ResourceType::Users => self.users.allows(operation),
            ResourceType::Other => self.other.allows(operation),
            ResourceType::Any => true,
        }
    }
}

/// A connection's ACL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Acl {
    /// Identity not resolved yet; nothing is granted
    #[default]
    Unauthenticated,
    Granted(Grants),
}

impl Acl {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Acl::Granted(_))
    }

    pub fn grants(&self) -> Option<&Grants> {
        match self {
            Acl::Granted(g) => Some(g),
            Acl::Unauthenticated => None,
        }
    }

    /// Check a descriptor; open descriptors still require authentication
    pub fn permits(&self, descriptor: &PermissionDescriptor) -> bool {
        match self {
            Acl::Unauthenticated => false,
            Acl::Granted(_) if descriptor.is_open() => true,
            Acl::Granted(g) => g.allows(descriptor.resource, descriptor.operation),
        }
    }
}
