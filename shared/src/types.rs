use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Which discovery protocol produced a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscoveryMethod {
    #[serde(rename = "mDNS")]
    Mdns,
    #[serde(rename = "UPnP")]
    Upnp,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMethod::Mdns => write!(f, "mDNS"),
            DiscoveryMethod::Upnp => write!(f, "UPnP"),
        }
    }
}

/// Distinguishes real hosts from multicast-group responders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    #[default]
    Unicast,
    Multicast,
}

/// A service found on the local network.
/// This is the canonical unit reported to subscribers of the scan event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Display name as supplied by the protocol; not unique on its own
    pub name: String,

    /// Address of the responding host
    pub address: IpAddr,

    /// Transport port, when the protocol exposes one
    pub port: Option<u16>,

    /// Protocol-specific type tag, e.g. "ipp" or a UPnP device URN
    pub service_type: String,

    pub discovery_method: DiscoveryMethod,

    pub address_kind: AddressKind,

    /// Protocol metadata, usually a JSON object; consumers parse best-effort
    pub details: Option<String>,

    pub is_secure: Option<bool>,

    /// Response latency in milliseconds
    pub response_time: Option<u64>,
}

impl DiscoveredService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            address: self.address,
            port: self.port,
        }
    }
}

/// Identity of a service within one scan: (name, address, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    pub address: IpAddr,
    pub port: Option<u16>,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}@{}:{}", self.name, self.address, port),
            None => write!(f, "{}@{}", self.name, self.address),
        }
    }
}

/// Terminal and running states of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Running,
    Completed,
    Errored,
    Cancelled,
}

/// Why a scan ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    Deadline,
    Stopped,
    ProbesFinished,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStarted {
    pub scan_id: u64,
    pub deadline_ms: u64,
}

/// A discovered or updated service together with the scan's progress at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNotice {
    #[serde(flatten)]
    pub service: DiscoveredService,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// 0-100, elapsed fraction of the deadline
    pub progress: u8,
    pub elapsed_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanComplete {
    pub scan_id: u64,
    pub reason: CompletionReason,
    pub services: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub scan_id: u64,
    pub error: String,
}

/// Everything the scan engine tells its subscribers, on one typed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ScanEvent {
    ScanStarted(ScanStarted),
    ServiceDiscovered(ServiceNotice),
    ServiceUpdated(ServiceNotice),
    ScanProgress(ScanProgress),
    ScanComplete(ScanComplete),
    ScanError(ScanFailure),
}

impl ScanEvent {
    /// Wire name of the event, matching the serde tag
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::ScanStarted(_) => crate::protocol::EVENT_SCAN_STARTED,
            ScanEvent::ServiceDiscovered(_) => crate::protocol::EVENT_SERVICE_DISCOVERED,
            ScanEvent::ServiceUpdated(_) => crate::protocol::EVENT_SERVICE_UPDATED,
            ScanEvent::ScanProgress(_) => crate::protocol::EVENT_SCAN_PROGRESS,
            ScanEvent::ScanComplete(_) => crate::protocol::EVENT_SCAN_COMPLETE,
            ScanEvent::ScanError(_) => crate::protocol::EVENT_SCAN_ERROR,
        }
    }

    /// True for the single event that ends a scan
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanEvent::ScanComplete(_) | ScanEvent::ScanError(_))
    }
}

/// Lifecycle of one protocol probe within a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    Idle,
    Listening,
    Emitting,
    Draining,
    Stopped,
}

impl ProbeState {
    /// Move forward to `next`. States only advance; nothing leaves `Stopped`.
    pub fn advance(self, next: ProbeState) -> ProbeState {
        if next > self { next } else { self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeStatus {
    pub name: String,
    pub method: DiscoveryMethod,
    pub state: ProbeState,
    pub records: u64,
    pub error: Option<String>,
}

/// Read-only view of a scan session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub scan_id: u64,
    pub state: ScanState,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub deadline_ms: u64,
    pub progress: u8,
    pub services: usize,
    pub probes: Vec<ProbeStatus>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Services grouped by the host that answered for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub address: IpAddr,
    pub address_kind: AddressKind,
    pub names: Vec<String>,
    pub hostname: Option<String>,
    pub discovery_methods: Vec<DiscoveryMethod>,
    pub service_types: Vec<String>,
    /// port -> service label
    pub open_ports: BTreeMap<u16, String>,
    pub uuid: Option<String>,
    pub location_url: Option<String>,
    pub server_info: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub postal: Option<String>,
    pub timezone: Option<String>,
    pub coordinates: Option<(f64, f64)>,
}

/// Facts about the machine's public network presence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicNetworkInfo {
    pub ip: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
    pub local_hostname: Option<String>,
    pub dns: Vec<String>,
    pub location: Option<GeoLocation>,
    pub is_vpn: Option<bool>,
    pub is_proxy: Option<bool>,
    pub is_hosting: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn printer() -> DiscoveredService {
        DiscoveredService {
            name: "printer".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            port: Some(631),
            service_type: "ipp".to_string(),
            discovery_method: DiscoveryMethod::Mdns,
            address_kind: AddressKind::Unicast,
            details: None,
            is_secure: Some(false),
            response_time: None,
        }
    }

    #[test]
    fn test_event_tag_matches_name() {
        let event = ScanEvent::ServiceDiscovered(ServiceNotice { service: printer(), progress: 12 });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], event.name());
        assert_eq!(json["payload"]["name"], "printer");
        assert_eq!(json["payload"]["discovery_method"], "mDNS");
        assert_eq!(json["payload"]["progress"], 12);
    }

    #[test]
    fn test_complete_event_round_trips() {
        let event = ScanEvent::ScanComplete(ScanComplete {
            scan_id: 3,
            reason: CompletionReason::ProbesFinished,
            services: 7,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"probes-finished\""));

        let back: ScanEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(back.is_terminal());
    }

    #[test]
    fn test_probe_state_never_moves_backwards() {
        let state = ProbeState::Idle.advance(ProbeState::Listening);
        assert_eq!(state, ProbeState::Listening);

        let state = state.advance(ProbeState::Emitting).advance(ProbeState::Listening);
        assert_eq!(state, ProbeState::Emitting);

        let stopped = state.advance(ProbeState::Stopped);
        assert_eq!(stopped.advance(ProbeState::Listening), ProbeState::Stopped);
        assert_eq!(stopped.advance(ProbeState::Draining), ProbeState::Stopped);
    }

    #[test]
    fn test_key_display() {
        let key = printer().key();
        assert_eq!(key.to_string(), "printer@10.0.0.5:631");
    }
}
