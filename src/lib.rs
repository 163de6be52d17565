#![doc = include_str!("../README.md")]

pub mod capture;
pub mod demux;
pub mod indexer;
pub mod tcp;
pub mod transport;

mod time;
mod wire;

pub use capture::{Engine, Interface, InterfaceStats};
pub use demux::{DatalinkType, Demux};
pub use indexer::{
    CaptureStatIndexer, DnsIndicators, EdnsVersionIndexer, Indexer, InterfaceNameIndexer,
};
pub use tcp::{SegmentHeader, TcpKey, TcpReassembler};
pub use transport::{DnsHandler, Proto, TransportMessage};

/// The well-known DNS port, used as the default port gate.
pub const DNS_PORT: u16 = 53;

/// Initialization-time failures.
///
/// The data path never reports errors: malformed or unwanted input is
/// dropped silently and shows up only as the gap between the kernel's
/// `filter_received` counter and `pkts_captured`.
#[derive(Debug)]
pub enum CaptureError {
    /// More capture sources than the engine supports.
    TooManyInterfaces { max: usize },

    /// An offline source was configured alongside another source.
    OfflineMustBeExclusive,

    /// The capture library reported a link type no decoder handles.
    UnsupportedDatalink { device: String, linktype: i32 },

    /// An open, filter-compile or filter-apply call failed.
    Pcap { device: String, source: pcap::Error },
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::TooManyInterfaces { max } => {
                write!(f, "too many capture sources (at most {max})")
            }
            CaptureError::OfflineMustBeExclusive => {
                write!(f, "an offline source must be the only capture source")
            }
            CaptureError::UnsupportedDatalink { device, linktype } => {
                write!(f, "unsupported data link type {linktype} on {device}")
            }
            CaptureError::Pcap { device, source } => {
                write!(f, "capture error on {device}: {source}")
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Pcap { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Builder for a configured [`Engine`].
///
/// # Examples
///
/// ```rust
/// use dns_capture::Engine;
///
/// let engine = Engine::builder()
///     .with_filter("udp port 53 or tcp port 53")
///     .with_promiscuous(true)
///     .with_vlan_id(101)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    promiscuous: bool,
    filter: String,
    dns_port: u16,
    vlan_ids: Vec<u16>,
    vlan_tag_byte_order_conversion: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            promiscuous: false,
            filter: String::new(),
            dns_port: DNS_PORT,
            vlan_ids: Vec::new(),
            vlan_tag_byte_order_conversion: true,
        }
    }
}

impl EngineBuilder {
    /// Open live sources in promiscuous mode.
    #[must_use = "builder methods consume self and return a new builder"]
    pub fn with_promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// BPF filter expression applied to every source. Compilation failure
    /// is reported by [`Engine::open`].
    #[must_use = "builder methods consume self and return a new builder"]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Port treated as DNS (default 53).
    #[must_use = "builder methods consume self and return a new builder"]
    pub fn with_dns_port(mut self, port: u16) -> Self {
        self.dns_port = port;
        self
    }

    /// Accept only frames tagged with this VLAN id. May be repeated; an
    /// empty allow-list accepts everything.
    #[must_use = "builder methods consume self and return a new builder"]
    pub fn with_vlan_id(mut self, vlan: u16) -> Self {
        self.vlan_ids.push(vlan);
        self
    }

    /// Whether 802.1Q tag-control bytes are read big-endian (default) or in
    /// host order.
    #[must_use = "builder methods consume self and return a new builder"]
    pub fn with_vlan_tag_byte_order_conversion(mut self, convert: bool) -> Self {
        self.vlan_tag_byte_order_conversion = convert;
        self
    }

    /// Build the engine; sources are added afterwards with
    /// [`Engine::open`].
    pub fn build(self) -> Engine {
        let mut demux = Demux::new(self.dns_port);
        demux.set_vlan_tag_byte_order_conversion(self.vlan_tag_byte_order_conversion);
        for vlan in self.vlan_ids {
            demux.add_vlan_id(vlan);
        }
        Engine::from_config(demux, self.promiscuous, self.filter)
    }
}
