//! In-memory record store fed by container lifecycle events.
//!
//! Names are stored as lower-cased FQDNs with a trailing dot, e.g.
//! `web.node.local.`. The last write for a name wins.

use hickory_proto::rr::RecordType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

use crate::metrics;

/// Build the FQDN a container hostname is published under.
pub fn container_fqdn(hostname: &str, domain: &str) -> String {
    normalize_name(&format!(
        "{}.{}",
        hostname.trim_matches('.'),
        domain.trim_matches('.')
    ))
}

/// Lower-case a name and make sure it ends with a dot.
pub fn normalize_name(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Thread-safe in-memory record store.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    inner: Arc<RwLock<RecordStoreInner>>,
}

#[derive(Debug, Default)]
struct RecordStoreInner {
    /// fqdn -> IPv4 address
    a: HashMap<String, Ipv4Addr>,

    /// fqdn -> IPv6 address (never populated by discovery)
    aaaa: HashMap<String, Ipv6Addr>,

    /// fqdn -> id of the container that last claimed it
    owners: HashMap<String, String>,

    /// Bumped on every change.
    generation: u64,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the A record for `name`.
    pub fn update(&self, name: &str, addr: Ipv4Addr) {
        let name = normalize_name(name);
        let mut inner = self.inner.write();
        debug!(name = %name, addr = %addr, "upserting A record");
        inner.owners.remove(&name);
        inner.a.insert(name, addr);
        inner.generation = inner.generation.wrapping_add(1);
    }

    /// Insert or overwrite the AAAA record for `name`.
    pub fn update_aaaa(&self, name: &str, addr: Ipv6Addr) {
        let name = normalize_name(name);
        let mut inner = self.inner.write();
        debug!(name = %name, addr = %addr, "upserting AAAA record");
        inner.aaaa.insert(name, addr);
        inner.generation = inner.generation.wrapping_add(1);
    }

    /// Insert or overwrite the A record for `name` on behalf of a container.
    ///
    /// Returns the previous address when the write replaced a different one.
    pub fn update_owned(
        &self,
        container_id: &str,
        name: &str,
        addr: Ipv4Addr,
    ) -> Option<Ipv4Addr> {
        let name = normalize_name(name);
        let mut inner = self.inner.write();
        debug!(name = %name, addr = %addr, container_id, "upserting A record");
        inner.owners.insert(name.clone(), container_id.to_string());
        let previous = inner.a.insert(name, addr);
        inner.generation = inner.generation.wrapping_add(1);
        previous.filter(|p| *p != addr)
    }

    /// Remove every record still owned by `container_id`.
    ///
    /// Names claimed by another container since are left alone. Returns the
    /// removed names.
    pub fn remove_owned(&self, container_id: &str) -> Vec<String> {
        let mut inner = self.inner.write();
        let names: Vec<String> = inner
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == container_id)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &names {
            inner.owners.remove(name);
            inner.a.remove(name);
            inner.aaaa.remove(name);
            debug!(name = %name, container_id, "removed record");
        }
        if !names.is_empty() {
            inner.generation = inner.generation.wrapping_add(1);
        }
        names
    }

    /// Look up the address for `name` and record type.
    ///
    /// Only `A` and `AAAA` are stored; other types always miss.
    pub fn lookup(&self, name: &str, rtype: RecordType) -> Option<IpAddr> {
        let name = normalize_name(name);
        let inner = self.inner.read();
        match rtype {
            RecordType::A => inner.a.get(&name).copied().map(IpAddr::V4),
            RecordType::AAAA => inner.aaaa.get(&name).copied().map(IpAddr::V6),
            _ => None,
        }
    }

    /// Whether an A record exists for `name`.
    pub fn has_a(&self, name: &str) -> bool {
        self.inner.read().a.contains_key(&normalize_name(name))
    }

    /// Container that last published `name`, if known.
    pub fn owner(&self, name: &str) -> Option<String> {
        self.inner.read().owners.get(&normalize_name(name)).cloned()
    }

    /// Number of A records.
    pub fn len(&self) -> usize {
        self.inner.read().a.len()
    }

    /// True when no A records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change counter, bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Emit current state metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        metrics::record_store_counts(inner.a.len(), inner.aaaa.len(), inner.owners.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_container_fqdn() {
        assert_eq!(container_fqdn("web", "node.local"), "web.node.local.");
        assert_eq!(container_fqdn("Web", "node.local."), "web.node.local.");
    }

    #[test]
    fn test_last_write_wins() {
        let store = RecordStore::new();
        store.update("a.node.local.", v4("10.0.0.5"));
        store.update("a.node.local.", v4("10.0.0.6"));

        assert_eq!(
            store.lookup("a.node.local.", RecordType::A),
            Some(IpAddr::V4(v4("10.0.0.6")))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lookup_is_case_insensitive_and_dot_tolerant() {
        let store = RecordStore::new();
        store.update("Web.Node.Local.", v4("10.0.0.1"));
        assert!(store.lookup("web.node.local", RecordType::A).is_some());
        assert!(store.has_a("WEB.node.local."));
    }

    #[test]
    fn test_no_aaaa_from_a() {
        let store = RecordStore::new();
        store.update("web.node.local.", v4("10.0.0.1"));
        assert_eq!(store.lookup("web.node.local.", RecordType::AAAA), None);
        assert_eq!(store.lookup("web.node.local.", RecordType::TXT), None);
    }

    #[test]
    fn test_remove_owned_only_removes_own_names() {
        let store = RecordStore::new();
        store.update_owned("c1", "web.node.local.", v4("10.0.0.1"));
        store.update_owned("c2", "db.node.local.", v4("10.0.0.2"));

        // c3 takes over the web name before c1's exit is processed.
        store.update_owned("c3", "web.node.local.", v4("10.0.0.3"));

        assert!(store.remove_owned("c1").is_empty());
        assert_eq!(
            store.lookup("web.node.local.", RecordType::A),
            Some(IpAddr::V4(v4("10.0.0.3")))
        );

        assert_eq!(store.remove_owned("c2"), vec!["db.node.local.".to_string()]);
        assert!(!store.has_a("db.node.local."));
    }

    #[test]
    fn test_update_owned_reports_changed_address() {
        let store = RecordStore::new();
        assert_eq!(store.update_owned("c1", "web", v4("10.0.0.1")), None);
        assert_eq!(store.update_owned("c1", "web", v4("10.0.0.1")), None);
        assert_eq!(
            store.update_owned("c2", "web", v4("10.0.0.2")),
            Some(v4("10.0.0.1"))
        );
        assert_eq!(store.owner("web"), Some("c2".to_string()));
    }

    #[test]
    fn test_generation_increments_on_change() {
        let store = RecordStore::new();
        let initial = store.generation();
        store.update("web", v4("10.0.0.1"));
        assert_eq!(store.generation(), initial + 1);
    }

    #[test]
    fn test_concurrent_writers_leave_consistent_state() {
        let store = RecordStore::new();
        let writers: Vec<_> = (0..8u8)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..200u8 {
                        store.update_owned(
                            &format!("c{w}"),
                            &format!("host{}.node.local.", i % 16),
                            Ipv4Addr::new(10, 0, w, i),
                        );
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.len(), 16);
        for i in 0..16u8 {
            let name = format!("host{i}.node.local.");
            let Some(IpAddr::V4(addr)) = store.lookup(&name, RecordType::A) else {
                panic!("missing {name}");
            };
            // The owner and the address must come from the same write.
            let owner = store.owner(&name).unwrap();
            assert_eq!(owner, format!("c{}", addr.octets()[2]));
            assert_eq!(addr.octets()[3] % 16, i);
        }
    }
}
