use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use serde_json::Value;
use shared::types::{DiscoveredService, HostSummary};
use crate::normalize::{address_kind, host_label};

/// Group services by the address that answered for them.
pub fn consolidate(services: &[DiscoveredService]) -> Vec<HostSummary> {
    let mut hosts: BTreeMap<IpAddr, HostBuilder> = BTreeMap::new();

    for service in services {
        hosts
            .entry(service.address)
            .or_insert_with(|| HostBuilder::new(service.address))
            .add(service);
    }

    hosts.into_values().map(HostBuilder::finish).collect()
}

struct HostBuilder {
    summary: HostSummary,
    /// "Manufacturer: Acme" style facts shown after the port list
    facts: Vec<String>,
}

impl HostBuilder {
    fn new(address: IpAddr) -> Self {
        Self {
            summary: HostSummary {
                address,
                address_kind: address_kind(&address),
                names: Vec::new(),
                hostname: None,
                discovery_methods: Vec::new(),
                service_types: Vec::new(),
                open_ports: BTreeMap::new(),
                uuid: None,
                location_url: None,
                server_info: None,
                description: String::new(),
            },
            facts: Vec::new(),
        }
    }

    fn add(&mut self, service: &DiscoveredService) {
        let summary = &mut self.summary;

        push_unique(&mut summary.names, &service.name);
        push_unique(&mut summary.service_types, &service.service_type);
        if !summary.discovery_methods.contains(&service.discovery_method) {
            summary.discovery_methods.push(service.discovery_method);
        }
        if let Some(port) = service.port {
            summary.open_ports.entry(port).or_insert_with(|| service.service_type.clone());
        }

        // Details are best-effort JSON; plain text just contributes nothing here
        let Some(details) = service
            .details
            .as_deref()
            .and_then(|d| serde_json::from_str::<HashMap<String, Value>>(d).ok())
        else {
            return;
        };
        let text = |key: &str| details.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());

        if summary.hostname.is_none() {
            summary.hostname = text("host").and_then(host_label).map(str::to_string);
        }
        if summary.uuid.is_none() {
            summary.uuid = text("uuid").map(str::to_string);
        }
        if summary.location_url.is_none() {
            summary.location_url = text("location").map(str::to_string);
        }
        if summary.server_info.is_none() {
            summary.server_info = text("server").map(str::to_string);
        }
        if let Some(port) = text("presentation_url").and_then(url_port) {
            summary.open_ports.entry(port).or_insert_with(|| "Web Interface".to_string());
        }

        for (key, label) in [("manufacturer", "Manufacturer"), ("model_name", "Model"), ("device_type", "Device Type")] {
            if let Some(value) = text(key) {
                let fact = format!("{}: {}", label, value);
                push_unique(&mut self.facts, &fact);
            }
        }
    }

    fn finish(mut self) -> HostSummary {
        self.summary.description = friendly_description(&self.summary, &self.facts);
        self.summary
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn url_port(url: &str) -> Option<u16> {
    reqwest::Url::parse(url).ok()?.port_or_known_default()
}

/// One-line human summary, e.g.
/// `Office Printer (printer) [ipp] - 10.0.0.5 - Services: ipp:631`
fn friendly_description(summary: &HostSummary, facts: &[String]) -> String {
    let mut parts = Vec::new();

    // Long or dotted names are usually raw protocol identifiers
    if let Some(name) = summary.names.iter().find(|n| n.len() < 30 && !n.contains('.')) {
        parts.push(name.clone());
    }

    if let Some(host) = &summary.hostname {
        if parts.is_empty() {
            parts.push(host.clone());
        } else {
            parts.push(format!("({})", host));
        }
    }

    if let Some(kind) = summary.service_types.first().filter(|t| t.as_str() != "unknown") {
        parts.push(format!("[{}]", kind));
    }

    let mut description = if parts.is_empty() {
        format!("Device at {}", summary.address)
    } else {
        parts.join(" ")
    };
    description.push_str(&format!(" - {}", summary.address));

    if !summary.open_ports.is_empty() {
        let services: Vec<String> = summary
            .open_ports
            .iter()
            .map(|(port, label)| format!("{}:{}", label, port))
            .collect();
        description.push_str(&format!(" - Services: {}", services.join(", ")));
    }

    if !facts.is_empty() {
        description.push_str("\nDetails: ");
        description.push_str(&facts.join(", "));
    }

    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{AddressKind, DiscoveryMethod};

    fn service(name: &str, address: &str, port: Option<u16>, ty: &str) -> DiscoveredService {
        DiscoveredService {
            name: name.to_string(),
            address: address.parse().unwrap(),
            port,
            service_type: ty.to_string(),
            discovery_method: DiscoveryMethod::Mdns,
            address_kind: AddressKind::Unicast,
            details: None,
            is_secure: None,
            response_time: None,
        }
    }

    #[test]
    fn test_groups_by_address() {
        let mut http = service("Office Printer", "10.0.0.5", Some(80), "http");
        http.details = Some(r#"{"host":"printer.local.","protocol":"TCP"}"#.to_string());

        let mut upnp = service("Office Printer", "10.0.0.5", None, "urn:schemas-upnp-org:device:Printer:1");
        upnp.discovery_method = DiscoveryMethod::Upnp;
        upnp.details = Some(
            r#"{"location":"http://10.0.0.5:5000/d.xml","uuid":"p-1","manufacturer":"Acme","presentation_url":"http://10.0.0.5:8080/"}"#
                .to_string(),
        );

        let hosts = consolidate(&[
            service("Office Printer", "10.0.0.5", Some(631), "ipp"),
            service("router", "10.0.0.1", Some(80), "http"),
            http,
            upnp,
        ]);

        assert_eq!(hosts.len(), 2);
        let printer = &hosts[1];
        assert_eq!(printer.address, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(printer.names, vec!["Office Printer"]);
        assert_eq!(printer.hostname.as_deref(), Some("printer"));
        assert_eq!(printer.uuid.as_deref(), Some("p-1"));
        assert_eq!(printer.discovery_methods, vec![DiscoveryMethod::Mdns, DiscoveryMethod::Upnp]);
        assert_eq!(printer.open_ports.keys().copied().collect::<Vec<_>>(), vec![80, 631, 8080]);
        assert_eq!(printer.open_ports[&8080], "Web Interface");
        assert_eq!(
            printer.description,
            "Office Printer (printer) [ipp] - 10.0.0.5 - Services: http:80, ipp:631, Web Interface:8080\nDetails: Manufacturer: Acme"
        );
    }

    #[test]
    fn test_opaque_details_are_tolerated() {
        let mut odd = service("printer.local.", "10.0.0.9", None, "unknown");
        odd.details = Some("not json".to_string());

        let hosts = consolidate(&[odd]);
        assert_eq!(hosts[0].hostname, None);
        assert_eq!(hosts[0].description, "Device at 10.0.0.9 - 10.0.0.9");
    }

    #[test]
    fn test_multicast_host_is_tagged() {
        let hosts = consolidate(&[service("group", "239.255.255.250", None, "ssdp:all")]);
        assert_eq!(hosts[0].address_kind, AddressKind::Multicast);
    }
}
