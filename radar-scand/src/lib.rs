//! Network discovery scan engine: mDNS and UPnP/SSDP probes, normalization,
//! per-scan deduplication and a scan coordinator with an event stream.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hosts;
pub mod normalize;
pub mod probe;
pub mod public_network;
pub mod session;
pub mod store;

pub use coordinator::{Phase, ScanCoordinator};
pub use error::{ProbeError, ScanError};
pub use probe::{Probe, ProbeContext, RawMetadata, RawRecord};
