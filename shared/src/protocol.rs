/// Event names on the wire (SSE event field and serde tag)
pub const EVENT_SCAN_STARTED: &str = "scan-started";
pub const EVENT_SERVICE_DISCOVERED: &str = "service-discovered";
pub const EVENT_SERVICE_UPDATED: &str = "service-updated";
pub const EVENT_SCAN_PROGRESS: &str = "scan-progress";
pub const EVENT_SCAN_COMPLETE: &str = "scan-complete";
pub const EVENT_SCAN_ERROR: &str = "scan-error";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Default hard deadline of a scan
pub const DEFAULT_DEADLINE_SECS: u64 = 60;

/// SSDP multicast group and port
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// DNS-SD meta-query that enumerates every advertised service type
pub const MDNS_META_QUERY: &str = "_services._dns-sd._udp.local.";

/// Service types browsed by default
pub const DEFAULT_MDNS_SERVICE_TYPES: &[&str] = &[
    "_http._tcp.local.",
    "_https._tcp.local.",
    "_ssh._tcp.local.",
    "_device-info._tcp.local.",
    "_spotify-connect._tcp.local.",
    "_airplay._tcp.local.",
    "_googlecast._tcp.local.",
    "_printer._tcp.local.",
    "_ipp._tcp.local.",
    "_homekit._tcp.local.",
    "_companion-link._tcp.local.",
];
