//! IP whitelist ACL overrides
//!
//! Keys are exact addresses (`192.168.1.17`), class-C style wildcards
//! (`192.168.1.*`) or `default`. An entry can only narrow what the
//! identity's computed grants allow.

use crate::acl::grants::{Grants, OpGrants};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Designated user meaning "keep the identity resolved by authentication"
pub const KEEP_AUTH_USER: &str = "auth";

const DEFAULT_KEY: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    #[serde(default = "default_entry_user")]
    pub user: String,
    #[serde(default = "OpGrants::all")]
    pub object: OpGrants,
    #[serde(default = "OpGrants::all")]
    pub state: OpGrants,
    #[serde(default = "OpGrants::all")]
    pub file: OpGrants,
}

fn default_entry_user() -> String {
    KEEP_AUTH_USER.to_string()
}

impl WhitelistEntry {
    /// The user this entry forces, if any
    pub fn override_user(&self) -> Option<&str> {
        if self.user == KEEP_AUTH_USER || self.user.is_empty() {
            None
        } else {
            Some(&self.user)
        }
    }

    /// AND each object/state/file flag with this entry
    pub fn narrow(&self, grants: &Grants) -> Grants {
        Grants {
            object: grants.object.intersect(&self.object),
            state: grants.state.intersect(&self.state),
            file: grants.file.intersect(&self.file),
            users: grants.users,
            other: grants.other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpWhitelist {
    entries: HashMap<String, WhitelistEntry>,
}

impl IpWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: WhitelistEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact address, then `a.b.c.*`, then `default`
    pub fn lookup(&self, addr: &IpAddr) -> Option<&WhitelistEntry> {
        let ip = normalize_ip(addr);

        if let Some(entry) = self.entries.get(&ip) {
            return Some(entry);
        }

        if let Some(entry) = class_c_key(&ip).and_then(|key| self.entries.get(&key)) {
            return Some(entry);
        }

        self.entries.get(DEFAULT_KEY)
    }
}

/// `a.b.c.*` for a dotted IPv4 address
fn class_c_key(ip: &str) -> Option<String> {
    let (network, _host) = ip.rsplit_once('.')?;
    Some(format!("{}.*", network))
}

/// Render an address the way whitelist keys are written
pub fn normalize_ip(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, state: OpGrants) -> WhitelistEntry {
        WhitelistEntry {
            user: user.to_string(),
            object: OpGrants::all(),
            state,
            file: OpGrants::all(),
        }
    }

    fn whitelist() -> IpWhitelist {
        let mut wl = IpWhitelist::new();
        wl.insert("192.168.1.17", entry("auth", OpGrants::all()));
        wl.insert("192.168.1.*", entry("guest", OpGrants::read_only()));
        wl.insert("default", entry("auth", OpGrants::none()));
        wl
    }

    #[test]
    fn test_lookup_order() {
        let wl = whitelist();

        let exact = wl.lookup(&"192.168.1.17".parse().unwrap()).unwrap();
        assert_eq!(exact.user, "auth");
        assert_eq!(exact.state, OpGrants::all());

        let wildcard = wl.lookup(&"192.168.1.99".parse().unwrap()).unwrap();
        assert_eq!(wildcard.user, "guest");

        let fallback = wl.lookup(&"10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(fallback.state, OpGrants::none());
    }

    #[test]
    fn test_lookup_ipv4_mapped() {
        let wl = whitelist();
        let mapped: IpAddr = "::ffff:192.168.1.17".parse().unwrap();
        assert_eq!(normalize_ip(&mapped), "192.168.1.17");
        assert_eq!(wl.lookup(&mapped).unwrap().state, OpGrants::all());
    }

    #[test]
    fn test_no_default_means_no_entry() {
        let mut wl = IpWhitelist::new();
        wl.insert("10.0.0.1", entry("auth", OpGrants::all()));
        assert!(wl.lookup(&"10.0.0.2".parse().unwrap()).is_none());
    }

    #[test]
    fn test_only_class_c_wildcards_match() {
        let mut wl = IpWhitelist::new();
        wl.insert("10.*", entry("guest", OpGrants::none()));
        wl.insert("10.0.0.*", entry("auth", OpGrants::read_only()));

        for _ in 0..32 {
            let e = wl.lookup(&"10.0.0.5".parse().unwrap()).unwrap();
            assert_eq!(e.state, OpGrants::read_only());
        }
        assert!(wl.lookup(&"10.1.2.3".parse().unwrap()).is_none());

        let mut wl = IpWhitelist::new();
        wl.insert("192.168.*", entry("guest", OpGrants::none()));
        assert!(wl.lookup(&"192.168.5.5".parse().unwrap()).is_none());
        assert!(wl.lookup(&"::1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_narrow_never_widens() {
        let mut computed = Grants::default();
        computed.state = OpGrants::read_only();

        let wide = entry("auth", OpGrants::all());
        assert_eq!(wide.narrow(&computed).state, OpGrants::read_only());

        let narrow = entry("auth", OpGrants { list: true, ..OpGrants::none() });
        let merged = narrow.narrow(&computed);
        assert!(merged.state.list);
        assert!(!merged.state.read);
    }

    #[test]
    fn test_override_user() {
        assert_eq!(entry("auth", OpGrants::all()).override_user(), None);
        assert_eq!(entry("guest", OpGrants::all()).override_user(), Some("guest"));
    }

    #[test]
    fn test_deserialize_from_config_json() {
        let wl: IpWhitelist = serde_json::from_str(
            r#"{"default": {"user": "guest", "state": {"read": true, "list": true}}}"#,
        )
        .unwrap();
        let e = wl.lookup(&"1.2.3.4".parse().unwrap()).unwrap();
        assert_eq!(e.user, "guest");
        assert!(e.state.read);
        assert!(!e.state.write);
        assert_eq!(e.object, OpGrants::all());
    }
}
