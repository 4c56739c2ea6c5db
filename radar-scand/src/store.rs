use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::{DiscoveredService, DiscoveryMethod, ServiceKey};

/// Outcome of offering a service to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    New,
    Changed,
    Unchanged,
}

/// Services seen during one scan session, keyed by (name, address, port).
///
/// Every offer overwrites the stored value so later data wins; the decision
/// only tells the caller whether subscribers need to hear about it.
#[derive(Debug, Default)]
pub struct DedupStore {
    services: Mutex<HashMap<ServiceKey, DiscoveredService>>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceKey, DiscoveredService>> {
        // A panic while holding the lock cannot leave the map half-written
        self.services.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn offer(&self, service: DiscoveredService) -> Decision {
        let key = service.key();
        let mut services = self.lock();

        let decision = match services.get(&key) {
            None => Decision::New,
            Some(old) if service_data_changed(old, &service) => Decision::Changed,
            Some(_) => Decision::Unchanged,
        };
        services.insert(key, service);
        decision
    }

    pub fn get(&self, key: &ServiceKey) -> Option<DiscoveredService> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All services, sorted by key
    pub fn snapshot(&self) -> Vec<DiscoveredService> {
        let mut services: Vec<DiscoveredService> = self.lock().values().cloned().collect();
        services.sort_by_key(|s| s.key());
        services
    }

    pub fn digest(&self) -> String {
        compute_hash(&self.snapshot())
    }
}

/// The fields whose change is worth an update notification
fn service_data_changed(old: &DiscoveredService, new: &DiscoveredService) -> bool {
    old.service_type != new.service_type
        || old.details != new.details
        || old.is_secure != new.is_secure
        || old.response_time != new.response_time
}

/// Hash only stable fields: response_time jitters on every multicast answer.
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    address: IpAddr,
    port: Option<u16>,
    service_type: &'a str,
    discovery_method: DiscoveryMethod,
    details: Option<&'a str>,
    is_secure: Option<bool>,
}

/// SHA-256 over the service list, independent of input order.
pub fn compute_hash(services: &[DiscoveredService]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by_key(|&i| services[i].key());

    let mut hasher = Sha256::new();
    for &i in &indices {
        let s = &services[i];
        let view = HashView {
            name: &s.name,
            address: s.address,
            port: s.port,
            service_type: &s.service_type,
            discovery_method: s.discovery_method,
            details: s.details.as_deref(),
            is_secure: s.is_secure,
        };
        match serde_json::to_vec(&view) {
            Ok(bytes) => hasher.update(&bytes),
            Err(e) => tracing::warn!("Failed to serialize {} for hashing: {}", s.key(), e),
        }
        hasher.update(b"\n");
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use shared::types::AddressKind;

    fn printer() -> DiscoveredService {
        DiscoveredService {
            name: "printer".to_string(),
            address: "10.0.0.5".parse().unwrap(),
            port: Some(631),
            service_type: "ipp".to_string(),
            discovery_method: DiscoveryMethod::Mdns,
            address_kind: AddressKind::Unicast,
            details: None,
            is_secure: Some(false),
            response_time: Some(4),
        }
    }

    #[test]
    fn test_offer_is_idempotent() {
        let store = DedupStore::new();

        let decisions: Vec<Decision> = (0..5).map(|_| store.offer(printer())).collect();

        assert_eq!(decisions[0], Decision::New);
        assert!(decisions[1..].iter().all(|d| *d == Decision::Unchanged));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_changed_response_time_is_an_update() {
        let store = DedupStore::new();
        store.offer(printer());

        let mut faster = printer();
        faster.response_time = Some(2);

        assert_eq!(store.offer(faster), Decision::Changed);
        assert_eq!(store.get(&printer().key()).unwrap().response_time, Some(2));
    }

    #[test]
    fn test_name_is_case_sensitive() {
        let store = DedupStore::new();
        store.offer(printer());

        let mut upper = printer();
        upper.name = "Printer".to_string();

        assert_eq!(store.offer(upper), Decision::New);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_untracked_fields_overwrite_silently() {
        let store = DedupStore::new();
        store.offer(printer());

        let mut other = printer();
        other.discovery_method = DiscoveryMethod::Upnp;

        assert_eq!(store.offer(other), Decision::Unchanged);
        assert_eq!(store.get(&printer().key()).unwrap().discovery_method, DiscoveryMethod::Upnp);
    }

    #[test]
    fn test_concurrent_offers_yield_one_new() {
        let store = Arc::new(DedupStore::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.offer(printer()))
            })
            .collect();

        let news = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| *d == Decision::New)
            .count();

        assert_eq!(news, 1);
    }

    #[test]
    fn test_hash_deterministic() {
        let mut second = printer();
        second.name = "scanner".to_string();

        let a = compute_hash(&[printer(), second.clone()]);
        let b = compute_hash(&[second, printer()]);

        assert_eq!(a, b, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_ignores_response_time() {
        let mut slower = printer();
        slower.response_time = Some(900);

        assert_eq!(compute_hash(&[printer()]), compute_hash(&[slower]));

        let mut moved = printer();
        moved.service_type = "ipps".to_string();
        assert_ne!(compute_hash(&[printer()]), compute_hash(&[moved]));
    }

    #[test]
    fn test_snapshot_sorted_by_key() {
        let store = DedupStore::new();
        let mut b = printer();
        b.name = "b".to_string();
        let mut a = printer();
        a.name = "a".to_string();
        store.offer(b);
        store.offer(a);

        let names: Vec<String> = store.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.digest(), compute_hash(&store.snapshot()));
    }
}
