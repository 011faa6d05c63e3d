//! Access control
//!
//! - `permissions`: static command -> {resource type, operation} table
//! - `grants`: typed per-connection grant set
//! - `whitelist`: per-IP overrides that can only narrow grants

mod grants;
mod permissions;
mod whitelist;

pub use grants::{Acl, Grants, OpGrants, OtherGrants};
pub use permissions::{Operation, PermissionDescriptor, PermissionTable, ResourceType};
pub use whitelist::{normalize_ip, IpWhitelist, WhitelistEntry, KEEP_AUTH_USER};

/// The administrative superuser, which bypasses every permission check
pub const ADMIN_USER: &str = "system.user.admin";

const USER_PREFIX: &str = "system.user.";

/// Qualify a bare user name (`admin` -> `system.user.admin`)
pub fn qualify_user(user: &str) -> String {
    if user.starts_with(USER_PREFIX) {
        user.to_string()
    } else {
        format!("{}{}", USER_PREFIX, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_user() {
        assert_eq!(qualify_user("admin"), ADMIN_USER);
        assert_eq!(qualify_user("system.user.admin"), ADMIN_USER);
    }
}
