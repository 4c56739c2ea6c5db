//! Raw probe records to canonical [`DiscoveredService`]s.
//!
//! Pure and stateless. Missing optional fields become `None`; only a record
//! without any usable address is rejected.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use serde::Serialize;
use shared::types::{AddressKind, DiscoveredService, DiscoveryMethod};
use crate::error::NormalizeError;
use crate::probe::{MdnsMetadata, RawMetadata, RawRecord, SsdpMetadata};
use crate::probe::description::Device;

const SECURE_PORTS: &[u16] = &[443, 8443];

pub fn normalize(record: RawRecord) -> Result<DiscoveredService, NormalizeError> {
    let address = resolve_address(record.address.as_deref(), record.source)?;

    let (name, service_type) = match record.protocol {
        DiscoveryMethod::Mdns => mdns_identity(&record),
        DiscoveryMethod::Upnp => upnp_identity(&record, address),
    };

    Ok(DiscoveredService {
        name,
        address,
        port: record.port,
        service_type,
        discovery_method: record.protocol,
        address_kind: address_kind(&address),
        details: details(&record.metadata),
        is_secure: detect_secure(&record),
        response_time: record
            .response_time
            .map(|rt| u64::try_from(rt.as_millis()).unwrap_or(u64::MAX)),
    })
}

/// Multicast group addresses answer for a group, not for one host.
pub fn address_kind(address: &IpAddr) -> AddressKind {
    let multicast = match address {
        IpAddr::V4(v4) => v4.octets()[0] == 239,
        IpAddr::V6(v6) => v6.is_multicast(),
    };

    if multicast {
        AddressKind::Multicast
    } else {
        AddressKind::Unicast
    }
}

/// Parse protocol-supplied address text: bare IPs, `ip:port`, `[v6]:port`,
/// `[v6]` and scoped `fe80::1%eth0` are all accepted.
pub fn parse_address(text: &str) -> Option<IpAddr> {
    let text = text.trim();
    if let Ok(addr) = text.parse::<IpAddr>() {
        return Some(addr);
    }
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Some(addr.ip());
    }

    let unbracketed = text
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(inner, _)| inner)
        .unwrap_or(text);
    let unscoped = unbracketed.split('%').next().unwrap_or(unbracketed);
    unscoped.parse().ok()
}

fn resolve_address(text: Option<&str>, source: Option<IpAddr>) -> Result<IpAddr, NormalizeError> {
    match (text.filter(|t| !t.trim().is_empty()), source) {
        (Some(text), source) => match parse_address(text) {
            Some(addr) => Ok(addr),
            None => source.ok_or_else(|| NormalizeError::InvalidAddress(text.to_string())),
        },
        (None, Some(source)) => Ok(source),
        (None, None) => Err(NormalizeError::MissingAddress),
    }
}

/// `_ipp._tcp.local.` -> `ipp`
pub fn clean_mdns_type(full_type: &str) -> String {
    let trimmed = full_type.trim_end_matches('.');
    let trimmed = trimmed.strip_suffix(".local").unwrap_or(trimmed);
    let trimmed = trimmed
        .strip_suffix("._tcp")
        .or_else(|| trimmed.strip_suffix("._udp"))
        .unwrap_or(trimmed);
    trimmed.replace('_', "")
}

fn transport(full_type: &str) -> &'static str {
    if full_type.contains("._tcp") {
        "TCP"
    } else if full_type.contains("._udp") {
        "UDP"
    } else {
        "Unknown"
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn mdns_identity(record: &RawRecord) -> (String, String) {
    let meta = match &record.metadata {
        RawMetadata::Mdns(meta) => Some(meta),
        _ => None,
    };

    let raw_type = non_empty(record.service_type.as_ref())
        .or_else(|| meta.map(|m| m.full_type.clone()))
        .unwrap_or_default();
    let mut service_type = clean_mdns_type(&raw_type);
    if service_type.is_empty() {
        service_type = "unknown".to_string();
    }

    let host_label = meta
        .map(|m| m.hostname.as_str())
        .filter(|host| host.contains('.'))
        .and_then(host_label)
        .map(str::to_string);

    let name = non_empty(record.name.as_ref())
        .or(host_label)
        .unwrap_or_else(|| format!("{} Device", service_type.to_uppercase()));

    (name, service_type)
}

/// First non-empty label of a DNS name: `printer.local.` -> `printer`
pub(crate) fn host_label(host: &str) -> Option<&str> {
    host.split('.').find(|label| !label.is_empty())
}

fn upnp_identity(record: &RawRecord, address: IpAddr) -> (String, String) {
    let name = non_empty(record.name.as_ref())
        .unwrap_or_else(|| format!("UPnP Device at {}", address));
    let service_type = non_empty(record.service_type.as_ref())
        .unwrap_or_else(|| "UPnP Device".to_string());
    (name, service_type)
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn detect_secure(record: &RawRecord) -> Option<bool> {
    let secure_port = record.port.map(|port| SECURE_PORTS.contains(&port));

    match &record.metadata {
        RawMetadata::Mdns(meta) => {
            let ty = meta.full_type.to_ascii_lowercase();
            let txt_secure = meta.properties.iter().any(|(key, value)| {
                matches!(key.to_ascii_lowercase().as_str(), "tls" | "secure" | "https") && is_truthy(value)
            });
            Some(ty.contains("https") || ty.contains("tls") || txt_secure || secure_port == Some(true))
        }
        RawMetadata::Ssdp(meta) => {
            let https = meta.location.to_ascii_lowercase().starts_with("https://");
            Some(https || secure_port == Some(true))
        }
        RawMetadata::None | RawMetadata::Opaque(_) => {
            let ty = record.service_type.as_deref().unwrap_or_default().to_ascii_lowercase();
            if ty.contains("https") || ty.contains("tls") {
                Some(true)
            } else {
                secure_port
            }
        }
    }
}

#[derive(Serialize)]
struct MdnsDetails<'a> {
    host: &'a str,
    full_name: &'a str,
    service_type: String,
    protocol: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    txt: BTreeMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<IpAddr>,
}

#[derive(Serialize)]
struct UpnpServiceDetails<'a> {
    service_type: &'a str,
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    control_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_sub_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scpd_url: Option<&'a str>,
}

#[derive(Serialize)]
struct EmbeddedDevice<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    friendly_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<&'a str>,
}

#[derive(Serialize)]
struct UpnpDetails<'a> {
    location: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upnp_version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usn: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    friendly_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_number: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial_number: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presentation_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    services: Vec<UpnpServiceDetails<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embedded_devices: Vec<EmbeddedDevice<'a>>,
}

fn details(metadata: &RawMetadata) -> Option<String> {
    match metadata {
        RawMetadata::None => None,
        RawMetadata::Mdns(meta) => serde_json::to_string(&mdns_details(meta)).ok(),
        RawMetadata::Ssdp(meta) => serde_json::to_string(&upnp_details(meta)).ok(),
        // Valid JSON is compacted, anything else survives verbatim
        RawMetadata::Opaque(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => Some(value.to_string()),
            Err(_) => Some(text.clone()),
        },
    }
}

fn mdns_details(meta: &MdnsMetadata) -> MdnsDetails<'_> {
    MdnsDetails {
        host: &meta.hostname,
        full_name: &meta.fullname,
        service_type: clean_mdns_type(&meta.full_type),
        protocol: transport(&meta.full_type),
        txt: meta
            .properties
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect(),
        addresses: meta.addresses.clone(),
    }
}

fn upnp_details(meta: &SsdpMetadata) -> UpnpDetails<'_> {
    let device: Option<&Device> = meta.description.as_ref().map(|d| &d.device);
    let field = |get: fn(&Device) -> &Option<String>| device.and_then(|d| get(d).as_deref());

    let server = meta.server.as_deref();
    let os = server.and_then(|s| s.split_whitespace().next());
    let upnp_version = server.and_then(|s| {
        s.split_whitespace().find(|token| token.to_ascii_uppercase().starts_with("UPNP/"))
    });

    let uuid = device.and_then(Device::uuid).or_else(|| {
        meta.usn
            .as_deref()
            .and_then(|usn| usn.strip_prefix("uuid:"))
            .map(|rest| rest.split("::").next().unwrap_or(rest))
    });

    let services = device
        .and_then(|d| d.service_list.as_ref())
        .map(|list| {
            list.services
                .iter()
                .map(|s| UpnpServiceDetails {
                    service_type: &s.service_type,
                    service_id: &s.service_id,
                    control_url: s.control_url.as_deref(),
                    event_sub_url: s.event_sub_url.as_deref(),
                    scpd_url: s.scpd_url.as_deref(),
                })
                .collect()
        })
        .unwrap_or_default();

    let embedded_devices = device
        .and_then(|d| d.device_list.as_ref())
        .map(|list| {
            list.devices
                .iter()
                .map(|d| EmbeddedDevice {
                    friendly_name: d.friendly_name.as_deref(),
                    device_type: d.device_type.as_deref(),
                    model_name: d.model_name.as_deref(),
                    manufacturer: d.manufacturer.as_deref(),
                })
                .collect()
        })
        .unwrap_or_default();

    UpnpDetails {
        location: &meta.location,
        server,
        os,
        upnp_version,
        search_target: meta.search_target.as_deref(),
        usn: meta.usn.as_deref(),
        uuid,
        device_type: field(|d| &d.device_type),
        friendly_name: field(|d| &d.friendly_name),
        manufacturer: field(|d| &d.manufacturer),
        manufacturer_url: field(|d| &d.manufacturer_url),
        model_name: field(|d| &d.model_name),
        model_description: field(|d| &d.model_description),
        model_number: field(|d| &d.model_number),
        model_url: field(|d| &d.model_url),
        serial_number: field(|d| &d.serial_number),
        presentation_url: field(|d| &d.presentation_url),
        services,
        embedded_devices,
    }
}
