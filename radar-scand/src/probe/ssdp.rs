use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use shared::protocol::SSDP_MULTICAST_ADDR;
use shared::types::DiscoveryMethod;
use crate::config::UpnpConfig;
use crate::error::ProbeError;
use super::description::{DescriptionFetcher, DeviceDescription};
use super::{Probe, ProbeContext, RawMetadata, RawRecord, SsdpMetadata};

const RECV_BUFFER: usize = 8192;

/// Headers of one SSDP search response.
#[derive(Debug, Clone, PartialEq)]
pub struct SsdpResponse {
    pub location: String,
    pub server: Option<String>,
    pub search_target: Option<String>,
    pub usn: Option<String>,
}

/// UPnP discovery via SSDP M-SEARCH.
pub struct SsdpProbe {
    config: UpnpConfig,
    target: SocketAddr,
}

impl SsdpProbe {
    pub fn new(config: UpnpConfig) -> Result<Self, ProbeError> {
        let target = SSDP_MULTICAST_ADDR
            .parse()
            .map_err(|e| ProbeError::Other(format!("bad SSDP group address: {}", e)))?;
        Ok(Self::with_target(config, target))
    }

    /// Search a specific address instead of the SSDP multicast group
    pub fn with_target(config: UpnpConfig, target: SocketAddr) -> Self {
        Self { config, target }
    }

    fn search_message(&self, search_target: &str) -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: {}\r\n\
             ST: {}\r\n\
             USER-AGENT: radar-scand/{} UPnP/1.1\r\n\r\n",
            SSDP_MULTICAST_ADDR,
            self.config.mx,
            search_target,
            env!("CARGO_PKG_VERSION"),
        )
    }

    /// Send one M-SEARCH per search target. Returns true if at least one went out.
    async fn send_search(&self, socket: &UdpSocket, ctx: &ProbeContext) -> bool {
        let mut sent = false;
        for search_target in &self.config.search_targets {
            let message = self.search_message(search_target);
            match socket.send_to(message.as_bytes(), self.target).await {
                Ok(_) => sent = true,
                Err(e) => {
                    ctx.warn(format!("Failed to send M-SEARCH for {}: {}", search_target, e)).await;
                }
            }
        }
        sent
    }
}

#[async_trait]
impl Probe for SsdpProbe {
    fn name(&self) -> &'static str {
        "ssdp"
    }

    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Upnp
    }

    async fn run(&self, ctx: ProbeContext) -> Result<(), ProbeError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| ProbeError::Bind { what: "SSDP socket", source })?;

        if let Err(e) = socket.set_multicast_ttl_v4(self.config.multicast_ttl) {
            ctx.warn(format!("Failed to set multicast TTL: {}", e)).await;
        }

        let mut fetcher = if self.config.fetch_descriptions {
            Some(DescriptionFetcher::new(Duration::from_millis(self.config.description_timeout_ms))?)
        } else {
            None
        };

        tracing::info!(target = %self.target, "SSDP probe listening");
        ctx.listening().await;

        let search_interval = Duration::from_secs(self.config.search_interval_secs.max(1));
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut consecutive_errors = 0u32;

        'rounds: loop {
            let sent_at = Instant::now();
            if self.send_search(&socket, &ctx).await {
                consecutive_errors = 0;
            } else {
                consecutive_errors += 1;
                if consecutive_errors >= self.config.max_recv_errors {
                    return Err(ProbeError::ReceiveBudgetExhausted(consecutive_errors));
                }
            }
            let next_round = sent_at + search_interval;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break 'rounds,

                    _ = tokio::time::sleep_until(next_round) => continue 'rounds,

                    Some((description, waiters)) = next_description(&mut fetcher) => {
                        for pending in waiters {
                            if !ctx.emit(pending.into_record(description.clone())).await {
                                break 'rounds;
                            }
                        }
                    }

                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(received) => {
                                consecutive_errors = 0;
                                received
                            }
                            Err(e) => {
                                consecutive_errors += 1;
                                if consecutive_errors >= self.config.max_recv_errors {
                                    return Err(ProbeError::ReceiveBudgetExhausted(consecutive_errors));
                                }
                                ctx.warn(format!("SSDP receive error: {}", e)).await;
                                continue;
                            }
                        };

                        let Some(response) = parse_response(&buf[..len]) else {
                            tracing::debug!("Ignoring malformed SSDP datagram from {}", from);
                            continue;
                        };

                        let pending = Pending {
                            source: from.ip(),
                            response_time: sent_at.elapsed(),
                            response,
                        };
                        let ready = match fetcher.as_mut() {
                            Some(fetcher) => {
                                let location = pending.response.location.clone();
                                fetcher.request(&location, pending)
                            }
                            None => Some((pending, None)),
                        };

                        if let Some((pending, description)) = ready {
                            if !ctx.emit(pending.into_record(description)).await {
                                break 'rounds;
                            }
                        }
                    }
                }
            }
        }

        let unsettled = fetcher.as_ref().map_or(0, |f| f.pending());
        tracing::debug!(unsettled, "SSDP probe draining");
        Ok(())
    }
}

/// A response waiting on its LOCATION's description
struct Pending {
    response: SsdpResponse,
    source: IpAddr,
    response_time: Duration,
}

impl Pending {
    fn into_record(self, description: Option<DeviceDescription>) -> RawRecord {
        build_record(self.response, self.source, self.response_time, description)
    }
}

async fn next_description(
    fetcher: &mut Option<DescriptionFetcher<Pending>>,
) -> Option<(Option<DeviceDescription>, Vec<Pending>)> {
    match fetcher {
        Some(fetcher) => fetcher.next_ready().await,
        None => None,
    }
}

/// Parse an SSDP search response. Returns None for anything that is not a
/// `200` response or has no LOCATION.
pub fn parse_response(datagram: &[u8]) -> Option<SsdpResponse> {
    let text = String::from_utf8_lossy(datagram);
    let mut lines = text.lines();

    let status = lines.next()?.trim();
    if !status.starts_with("HTTP/") || status.split_whitespace().nth(1) != Some("200") {
        return None;
    }

    let mut response = SsdpResponse {
        location: String::new(),
        server: None,
        search_target: None,
        usn: None,
    };

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_uppercase().as_str() {
            "LOCATION" => response.location = value,
            "SERVER" => response.server = Some(value),
            "ST" => response.search_target = Some(value),
            "USN" => response.usn = Some(value),
            _ => {}
        }
    }

    if response.location.is_empty() {
        None
    } else {
        Some(response)
    }
}

fn build_record(
    response: SsdpResponse,
    source: IpAddr,
    response_time: Duration,
    description: Option<DeviceDescription>,
) -> RawRecord {
    let (address, port) = match reqwest::Url::parse(&response.location) {
        Ok(url) => (url.host_str().map(str::to_string), url.port_or_known_default()),
        Err(_) => (None, None),
    };

    let device = description.as_ref().map(|d| &d.device);
    let name = device.and_then(|d| d.friendly_name.clone().or_else(|| d.model_name.clone()));
    let service_type = device
        .and_then(|d| d.device_type.clone())
        .or_else(|| response.search_target.clone());

    RawRecord {
        address,
        source: Some(source),
        port,
        name,
        service_type,
        metadata: RawMetadata::Ssdp(SsdpMetadata {
            location: response.location,
            server: response.server,
            search_target: response.search_target,
            usn: response.usn,
            description,
        }),
        response_time: Some(response_time),
        ..RawRecord::new(DiscoveryMethod::Upnp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use crate::probe::ProbeSignal;

    const ROUTER_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age=1800\r\n\
        Location: http://192.168.1.1:49152/rootDesc.xml\r\n\
        SERVER: Linux/3.14 UPnP/1.0 MiniUPnPd/2.1\r\n\
        ST: upnp:rootdevice\r\n\
        USN: uuid:1234-abcd::upnp:rootdevice\r\n\r\n";

    #[test]
    fn test_parse_search_response() {
        let response = parse_response(ROUTER_RESPONSE.as_bytes()).unwrap();

        assert_eq!(response.location, "http://192.168.1.1:49152/rootDesc.xml");
        assert_eq!(response.server.as_deref(), Some("Linux/3.14 UPnP/1.0 MiniUPnPd/2.1"));
        assert_eq!(response.search_target.as_deref(), Some("upnp:rootdevice"));
        assert_eq!(response.usn.as_deref(), Some("uuid:1234-abcd::upnp:rootdevice"));
    }

    #[test]
    fn test_parse_rejects_non_responses() {
        assert!(parse_response(b"M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n\r\n").is_none());
        assert!(parse_response(b"HTTP/1.1 404 Not Found\r\nLOCATION: http://x/\r\n\r\n").is_none());
        assert!(parse_response(b"HTTP/1.1 200 OK\r\nST: ssdp:all\r\n\r\n").is_none());
        assert!(parse_response(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_notify_is_not_a_search_response() {
        let notify = "NOTIFY * HTTP/1.1\r\nLOCATION: http://10.0.0.9/d.xml\r\nNT: upnp:rootdevice\r\nNTS: ssdp:alive\r\n\r\n";
        assert!(parse_response(notify.as_bytes()).is_none());
    }

    #[test]
    fn test_record_takes_address_from_location() {
        let response = parse_response(ROUTER_RESPONSE.as_bytes()).unwrap();
        let source: IpAddr = "192.168.1.1".parse().unwrap();

        let record = build_record(response, source, Duration::from_millis(12), None);

        assert_eq!(record.address.as_deref(), Some("192.168.1.1"));
        assert_eq!(record.port, Some(49152));
        assert_eq!(record.name, None);
        assert_eq!(record.service_type.as_deref(), Some("upnp:rootdevice"));
        assert_eq!(record.response_time, Some(Duration::from_millis(12)));
    }

    #[test]
    fn test_record_defaults_http_port() {
        let response = SsdpResponse {
            location: "http://10.0.0.7/desc.xml".to_string(),
            server: None,
            search_target: None,
            usn: None,
        };
        let record = build_record(response, "10.0.0.7".parse().unwrap(), Duration::ZERO, None);
        assert_eq!(record.port, Some(80));
    }

    #[tokio::test]
    async fn test_probe_against_local_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..len]).starts_with("M-SEARCH"));

            responder.send_to(b"garbage", from).await.unwrap();
            let reply = "HTTP/1.1 200 OK\r\nLOCATION: http://127.0.0.1:1/desc.xml\r\nST: upnp:rootdevice\r\n\r\n";
            responder.send_to(reply.as_bytes(), from).await.unwrap();
        });

        let config = UpnpConfig {
            search_targets: vec!["upnp:rootdevice".to_string()],
            fetch_descriptions: false,
            ..UpnpConfig::default()
        };
        let probe = SsdpProbe::with_target(config, responder_addr);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let ctx = ProbeContext::new(0, "ssdp", tx, cancel.clone());
        let handle = tokio::spawn(async move { probe.run(ctx).await });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.signal, ProbeSignal::Listening));

        let second = rx.recv().await.unwrap();
        match second.signal {
            ProbeSignal::Record(record) => {
                assert_eq!(record.address.as_deref(), Some("127.0.0.1"));
                assert_eq!(record.port, Some(1));
            }
            other => panic!("expected a record, got {:?}", other),
        }

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_slow_description_does_not_hold_up_other_responses() {
        // Accepts connections but never answers, so its fetch runs to the timeout
        let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_port = stalled.local_addr().unwrap().port();

        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let _stalled = stalled;
            let mut buf = [0u8; 2048];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();

            let slow = format!(
                "HTTP/1.1 200 OK\r\nLOCATION: http://127.0.0.1:{}/desc.xml\r\nST: upnp:rootdevice\r\n\r\n",
                stalled_port
            );
            responder.send_to(slow.as_bytes(), from).await.unwrap();
            let fast = "HTTP/1.1 200 OK\r\nLOCATION: http://127.0.0.1:1/desc.xml\r\nST: upnp:rootdevice\r\n\r\n";
            responder.send_to(fast.as_bytes(), from).await.unwrap();
            futures::future::pending::<()>().await;
        });

        let config = UpnpConfig {
            search_targets: vec!["upnp:rootdevice".to_string()],
            fetch_descriptions: true,
            description_timeout_ms: 10_000,
            ..UpnpConfig::default()
        };
        let probe = SsdpProbe::with_target(config, responder_addr);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let ctx = ProbeContext::new(0, "ssdp", tx, cancel.clone());
        let handle = tokio::spawn(async move { probe.run(ctx).await });

        assert!(matches!(rx.recv().await.unwrap().signal, ProbeSignal::Listening));

        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second response waited on the first one's description")
            .unwrap();
        match next.signal {
            ProbeSignal::Record(record) => assert_eq!(record.port, Some(1)),
            other => panic!("expected a record, got {:?}", other),
        }

        // The stalled fetch is dropped, not awaited
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
