use std::collections::HashSet;
use std::net::IpAddr;
use std::pin::Pin;
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use shared::protocol::MDNS_META_QUERY;
use shared::types::DiscoveryMethod;
use crate::config::MdnsConfig;
use crate::error::ProbeError;
use super::{MdnsMetadata, Probe, ProbeContext, RawMetadata, RawRecord};

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of the receiver, avoiding borrow issues with the
/// receivers vec. flume::Receiver is Clone (multi-consumer).
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

async fn recv_meta(
    rx: &Option<flume::Receiver<ServiceEvent>>,
) -> std::result::Result<ServiceEvent, flume::RecvError> {
    match rx {
        Some(rx) => rx.recv_async().await,
        None => futures::future::pending().await,
    }
}

/// Multicast DNS / DNS-SD browser.
pub struct MdnsProbe {
    config: MdnsConfig,
}

impl MdnsProbe {
    pub fn new(config: MdnsConfig) -> Self {
        Self { config }
    }

    async fn browse(&self, daemon: &ServiceDaemon, ctx: &ProbeContext) -> Result<(), ProbeError> {
        if let Some(interface) = &self.config.interface {
            daemon.disable_interface(mdns_sd::IfKind::All)?;
            daemon.enable_interface(interface.as_str())?;
        }

        let mut browsed_types = HashSet::new();
        let mut next_idx = 0usize;
        let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

        for service_type in &self.config.service_types {
            match daemon.browse(service_type) {
                Ok(receiver) => {
                    browsed_types.insert(service_type.clone());
                    type_futures.push(make_recv_future(next_idx, receiver));
                    next_idx += 1;
                }
                Err(e) => {
                    ctx.warn(format!("Failed to browse {}: {}", service_type, e)).await;
                }
            }
        }

        let mut meta_receiver = if self.config.browse_all {
            match daemon.browse(MDNS_META_QUERY) {
                Ok(receiver) => Some(receiver),
                Err(e) => {
                    ctx.warn(format!("Failed to start meta-query browse: {}", e)).await;
                    None
                }
            }
        } else {
            None
        };

        if type_futures.is_empty() && meta_receiver.is_none() {
            return Err(ProbeError::Other("no mDNS service type could be browsed".to_string()));
        }

        tracing::info!(types = browsed_types.len(), browse_all = meta_receiver.is_some(), "mDNS probe listening");
        ctx.listening().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::debug!("mDNS probe draining");
                    break;
                }

                // New service types announced through the meta-query
                event = recv_meta(&meta_receiver) => {
                    match event {
                        Ok(ServiceEvent::ServiceFound(_, service_type))
                            if is_service_type(&service_type) =>
                        {
                            if !browsed_types.contains(&service_type) {
                                tracing::debug!("Discovered new service type: {}", service_type);
                                match daemon.browse(&service_type) {
                                    Ok(receiver) => {
                                        type_futures.push(make_recv_future(next_idx, receiver));
                                        next_idx += 1;
                                    }
                                    Err(e) => {
                                        ctx.warn(format!("Failed to browse {}: {}", service_type, e)).await;
                                    }
                                }
                                browsed_types.insert(service_type);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            ctx.warn(format!("Meta-query receiver disconnected: {}", e)).await;
                            meta_receiver = None;
                        }
                    }
                }

                Some((idx, rx, result)) = type_futures.next() => {
                    match result {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let record = convert_service_info(&info);
                            tracing::debug!("Resolved service: {}", info.get_fullname());
                            if !ctx.emit(record).await {
                                break;
                            }
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                            tracing::debug!("Service removed: {}", fullname);
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Ok(_) => {
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Err(e) => {
                            ctx.warn(format!("Receiver {} disconnected: {}", idx, e)).await;
                        }
                    }
                }
            }

            if type_futures.is_empty() && meta_receiver.is_none() {
                tracing::info!("mDNS probe has no receivers left");
                break;
            }
        }

        for service_type in &browsed_types {
            if let Err(e) = daemon.stop_browse(service_type) {
                tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
            }
        }
        if self.config.browse_all {
            let _ = daemon.stop_browse(MDNS_META_QUERY);
        }

        Ok(())
    }
}

#[async_trait]
impl Probe for MdnsProbe {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Mdns
    }

    async fn run(&self, ctx: ProbeContext) -> Result<(), ProbeError> {
        // One daemon per scan; creating it binds the multicast sockets
        let daemon = ServiceDaemon::new()?;

        let result = self.browse(&daemon, &ctx).await;

        if let Err(e) = daemon.shutdown() {
            tracing::debug!("Failed to shutdown mDNS daemon: {}", e);
        }

        result
    }
}

fn is_service_type(name: &str) -> bool {
    name.ends_with("._tcp.local.") || name.ends_with("._udp.local.")
}

/// Instance label of a full name, e.g. "Office Printer" from
/// "Office Printer._ipp._tcp.local."
fn instance_name(fullname: &str, service_type: &str) -> Option<String> {
    let instance = fullname.strip_suffix(service_type)?.trim_end_matches('.');
    if instance.is_empty() {
        None
    } else {
        Some(instance.to_string())
    }
}

/// Convert an mdns-sd ServiceInfo to a raw record
fn convert_service_info(info: &ServiceInfo) -> RawRecord {
    // IPv4 first, then IPv6, each in address order
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort_by_key(|addr| (addr.is_ipv6(), *addr));

    let properties: Vec<(String, String)> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    RawRecord {
        address: addresses.first().map(|addr| addr.to_string()),
        port: Some(info.get_port()),
        name: instance_name(info.get_fullname(), info.get_type()),
        service_type: Some(info.get_type().to_string()),
        metadata: RawMetadata::Mdns(MdnsMetadata {
            hostname: info.get_hostname().to_string(),
            fullname: info.get_fullname().to_string(),
            full_type: info.get_type().to_string(),
            properties,
            addresses,
        }),
        ..RawRecord::new(DiscoveryMethod::Mdns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_instance_name_strips_type() {
        assert_eq!(
            instance_name("Office Printer._ipp._tcp.local.", "_ipp._tcp.local."),
            Some("Office Printer".to_string())
        );
        assert_eq!(instance_name("_ipp._tcp.local.", "_ipp._tcp.local."), None);
        assert_eq!(instance_name("other.local.", "_ipp._tcp.local."), None);
    }

    #[test]
    fn test_meta_query_answers_are_filtered() {
        assert!(is_service_type("_http._tcp.local."));
        assert!(is_service_type("_sleep-proxy._udp.local."));
        assert!(!is_service_type("printer.local."));
    }

    #[test]
    fn test_convert_prefers_ipv4() {
        let txt = HashMap::from([("rp".to_string(), "ipp/print".to_string())]);
        let info = ServiceInfo::new(
            "_ipp._tcp.local.",
            "printer",
            "printer.local.",
            "fe80::1,10.0.0.5",
            631,
            txt,
        )
        .unwrap();

        let record = convert_service_info(&info);

        assert_eq!(record.protocol, DiscoveryMethod::Mdns);
        assert_eq!(record.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(record.port, Some(631));
        assert_eq!(record.name.as_deref(), Some("printer"));
        match record.metadata {
            RawMetadata::Mdns(meta) => {
                assert_eq!(meta.addresses.len(), 2);
                assert_eq!(meta.properties, vec![("rp".to_string(), "ipp/print".to_string())]);
            }
            other => panic!("unexpected metadata {:?}", other),
        }
    }
}
