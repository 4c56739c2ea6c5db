use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Deserialize;
use crate::error::ProbeError;

/// UPnP device description document (the XML behind an SSDP LOCATION).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDescription {
    pub device: Device,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(rename = "deviceType")]
    pub device_type: Option<String>,
    #[serde(rename = "friendlyName")]
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    #[serde(rename = "manufacturerURL")]
    pub manufacturer_url: Option<String>,
    #[serde(rename = "modelDescription")]
    pub model_description: Option<String>,
    #[serde(rename = "modelName")]
    pub model_name: Option<String>,
    #[serde(rename = "modelNumber")]
    pub model_number: Option<String>,
    #[serde(rename = "modelURL")]
    pub model_url: Option<String>,
    #[serde(rename = "serialNumber")]
    pub serial_number: Option<String>,
    #[serde(rename = "UDN")]
    pub udn: Option<String>,
    #[serde(rename = "presentationURL")]
    pub presentation_url: Option<String>,
    #[serde(rename = "serviceList")]
    pub service_list: Option<ServiceList>,
    #[serde(rename = "deviceList")]
    pub device_list: Option<DeviceList>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceList {
    #[serde(rename = "service", default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Service {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "controlURL")]
    pub control_url: Option<String>,
    #[serde(rename = "eventSubURL")]
    pub event_sub_url: Option<String>,
    #[serde(rename = "SCPDURL")]
    pub scpd_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceList {
    #[serde(rename = "device", default)]
    pub devices: Vec<Device>,
}

impl Device {
    /// UUID part of the UDN ("uuid:...")
    pub fn uuid(&self) -> Option<&str> {
        self.udn.as_deref().and_then(|udn| udn.strip_prefix("uuid:"))
    }
}

pub fn parse(xml: &str) -> Result<DeviceDescription, quick_xml::DeError> {
    quick_xml::de::from_str(xml)
}

/// Descriptions fetched at once; further locations wait their turn
const MAX_IN_FLIGHT: usize = 8;

type FetchFuture = BoxFuture<'static, (String, Option<DeviceDescription>)>;

/// Fetches and caches device descriptions for the lifetime of one probe run.
///
/// Fetches run concurrently and are polled through `next_ready`, so a slow
/// LOCATION never holds up whoever is receiving responses. Each `W` is a
/// waiter handed back once the description it asked for is settled.
pub struct DescriptionFetcher<W> {
    client: reqwest::Client,
    /// Failures are cached as `None` so a dead LOCATION is tried once
    cache: HashMap<String, Option<DeviceDescription>>,
    waiting: HashMap<String, Vec<W>>,
    queued: VecDeque<String>,
    in_flight: FuturesUnordered<FetchFuture>,
}

impl<W> DescriptionFetcher<W> {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache: HashMap::new(),
            waiting: HashMap::new(),
            queued: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
        })
    }

    /// Ask for the description at `location`. A cached answer comes back at
    /// once; otherwise the waiter is parked until `next_ready` settles it.
    pub fn request(&mut self, location: &str, waiter: W) -> Option<(W, Option<DeviceDescription>)> {
        if let Some(cached) = self.cache.get(location) {
            return Some((waiter, cached.clone()));
        }

        let waiters = self.waiting.entry(location.to_string()).or_default();
        waiters.push(waiter);
        if waiters.len() == 1 {
            if self.in_flight.len() < MAX_IN_FLIGHT {
                self.spawn(location.to_string());
            } else {
                self.queued.push_back(location.to_string());
            }
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len() + self.queued.len()
    }

    /// Wait for the next fetch to settle. Returns None when nothing is in flight.
    pub async fn next_ready(&mut self) -> Option<(Option<DeviceDescription>, Vec<W>)> {
        let (location, description) = self.in_flight.next().await?;

        if let Some(next) = self.queued.pop_front() {
            self.spawn(next);
        }

        self.cache.insert(location.clone(), description.clone());
        let waiters = self.waiting.remove(&location).unwrap_or_default();
        Some((description, waiters))
    }

    fn spawn(&mut self, location: String) {
        self.in_flight.push(fetch(self.client.clone(), location).boxed());
    }
}

async fn fetch(client: reqwest::Client, location: String) -> (String, Option<DeviceDescription>) {
    let description = fetch_uncached(&client, &location).await;
    (location, description)
}

async fn fetch_uncached(client: &reqwest::Client, location: &str) -> Option<DeviceDescription> {
    let response = match client.get(location).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Failed to fetch device description {}: {}", location, e);
            return None;
        }
    };

    let text = match response.error_for_status() {
        Ok(response) => response.text().await,
        Err(e) => Err(e),
    };

    let text = match text {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("Bad device description response from {}: {}", location, e);
            return None;
        }
    };

    match parse(&text) {
        Ok(description) => Some(description),
        Err(e) => {
            tracing::debug!("Malformed device description at {}: {}", location, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTER_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>Home Router</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>AR-100</modelName>
    <UDN>uuid:1234-abcd</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:L3Forwarding1</serviceId>
        <controlURL>/ctl/L3F</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <friendlyName>WAN</friendlyName>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_router_description() {
        let desc = parse(ROUTER_XML).unwrap();
        let device = &desc.device;

        assert_eq!(device.friendly_name.as_deref(), Some("Home Router"));
        assert_eq!(device.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(device.uuid(), Some("1234-abcd"));
        assert_eq!(device.serial_number, None);

        let services = &device.service_list.as_ref().unwrap().services;
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].control_url.as_deref(), Some("/ctl/L3F"));
        assert_eq!(services[1].control_url, None);

        let embedded = &device.device_list.as_ref().unwrap().devices;
        assert_eq!(embedded[0].friendly_name.as_deref(), Some("WAN"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("this is not xml at all").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_location_is_fetched_once() {
        let mut fetcher = DescriptionFetcher::new(Duration::from_millis(200)).unwrap();
        let location = "http://127.0.0.1:1/description.xml";

        assert!(fetcher.request(location, 1).is_none());
        assert!(fetcher.request(location, 2).is_none());
        assert_eq!(fetcher.pending(), 1);

        let (description, waiters) = fetcher.next_ready().await.unwrap();
        assert!(description.is_none());
        assert_eq!(waiters, vec![1, 2]);

        // Settled as missing; later responses do not refetch
        assert_eq!(fetcher.request(location, 3), Some((3, None)));
        assert_eq!(fetcher.pending(), 0);
        assert!(fetcher.next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_fetches_beyond_the_limit_are_queued() {
        let mut fetcher = DescriptionFetcher::new(Duration::from_millis(200)).unwrap();
        for port in 1..=(MAX_IN_FLIGHT as u16 + 2) {
            let location = format!("http://127.0.0.1:{}/d.xml", port);
            assert!(fetcher.request(&location, port).is_none());
        }
        assert_eq!(fetcher.in_flight.len(), MAX_IN_FLIGHT);
        assert_eq!(fetcher.pending(), MAX_IN_FLIGHT + 2);

        let mut settled = Vec::new();
        while let Some((_, waiters)) = fetcher.next_ready().await {
            settled.extend(waiters);
        }
        settled.sort_unstable();
        assert_eq!(settled, (1..=(MAX_IN_FLIGHT as u16 + 2)).collect::<Vec<_>>());
    }
}
