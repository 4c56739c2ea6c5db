//! Protocol probes: independent discovery backends, one per protocol.
//!
//! A probe runs on its own task, reports `listening` once its sockets are
//! bound, then streams [`RawRecord`]s until its cancellation token fires.
//! Failures stay inside the probe; the coordinator only learns whether the
//! probe ever started and how it ended.

pub mod description;
pub mod mdns;
pub mod ssdp;

use std::net::IpAddr;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::DiscoveryMethod;
use crate::error::ProbeError;

pub use description::DeviceDescription;
pub use mdns::MdnsProbe;
pub use ssdp::SsdpProbe;

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    fn method(&self) -> DiscoveryMethod;

    /// Discover until cancelled or exhausted.
    ///
    /// Implementations call [`ProbeContext::listening`] once their sockets are
    /// bound. Returning an error before that point means the protocol could not
    /// be started for this scan.
    async fn run(&self, ctx: ProbeContext) -> Result<(), ProbeError>;
}

/// Protocol record as received, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub protocol: DiscoveryMethod,
    /// Address text as the protocol supplied it (may carry a port or brackets)
    pub address: Option<String>,
    /// Sender of the datagram, used when `address` is missing or unusable
    pub source: Option<IpAddr>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub service_type: Option<String>,
    pub metadata: RawMetadata,
    pub response_time: Option<Duration>,
}

impl RawRecord {
    pub fn new(protocol: DiscoveryMethod) -> Self {
        Self {
            protocol,
            address: None,
            source: None,
            port: None,
            name: None,
            service_type: None,
            metadata: RawMetadata::None,
            response_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawMetadata {
    None,
    Mdns(MdnsMetadata),
    Ssdp(SsdpMetadata),
    /// Anything else; kept verbatim if it is not valid JSON
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MdnsMetadata {
    pub hostname: String,
    pub fullname: String,
    /// Full DNS-SD type, e.g. "_ipp._tcp.local."
    pub full_type: String,
    pub properties: Vec<(String, String)>,
    pub addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SsdpMetadata {
    pub location: String,
    pub server: Option<String>,
    pub search_target: Option<String>,
    pub usn: Option<String>,
    pub description: Option<DeviceDescription>,
}

#[derive(Debug)]
pub(crate) struct ProbeMessage {
    pub probe: usize,
    pub signal: ProbeSignal,
}

#[derive(Debug)]
pub(crate) enum ProbeSignal {
    Listening,
    Record(RawRecord),
    Warning(String),
}

/// What a running probe gets from the coordinator.
pub struct ProbeContext {
    index: usize,
    name: &'static str,
    tx: mpsc::Sender<ProbeMessage>,
    cancel: CancellationToken,
}

impl ProbeContext {
    pub(crate) fn new(
        index: usize,
        name: &'static str,
        tx: mpsc::Sender<ProbeMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self { index, name, tx, cancel }
    }

    /// Report that sockets are bound and discovery has begun
    pub async fn listening(&self) {
        self.send(ProbeSignal::Listening).await;
    }

    /// Forward a record. Returns false once the scan no longer accepts records.
    pub async fn emit(&self, record: RawRecord) -> bool {
        self.send(ProbeSignal::Record(record)).await
    }

    /// Record a recoverable, probe-local problem
    pub async fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(probe = self.name, "{}", message);
        self.send(ProbeSignal::Warning(message)).await;
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    async fn send(&self, signal: ProbeSignal) -> bool {
        let msg = ProbeMessage { probe: self.index, signal };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(msg) => res.is_ok(),
        }
    }
}
