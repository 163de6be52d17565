use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

/// Layer-4 protocol of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Proto {
    Udp,
    Tcp,
}

/// Decoded layer-3/4 addressing for one captured frame.
///
/// Built fresh for every frame on the demux path and handed to the DNS
/// callback together with the message payload. Owns nothing beyond value
/// fields; address and port fields are meaningful only once the IP and
/// transport layers have been decoded.
#[derive(Debug, Clone, Serialize)]
pub struct TransportMessage {
    /// Capture timestamp, seconds part.
    pub ts_sec: i64,
    /// Capture timestamp, microseconds part.
    pub ts_usec: i64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Proto,
}

impl TransportMessage {
    pub fn new(ts_sec: i64, ts_usec: i64) -> Self {
        Self {
            ts_sec,
            ts_usec,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            proto: Proto::Udp,
        }
    }

    /// IP version of the source address (4 or 6).
    pub fn ip_version(&self) -> u8 {
        match self.src_ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// Capture timestamp as a [`std::time::SystemTime`].
    pub fn timestamp(&self) -> std::time::SystemTime {
        crate::time::build_unix_time(self.ts_sec, self.ts_usec)
    }
}

/// Downstream consumer of complete DNS messages.
///
/// The demux path guarantees `payload` is a single complete DNS-over-UDP
/// datagram or a single complete DNS-over-TCP message with the two-byte
/// length prefix already stripped, at most 65 535 bytes long.
///
/// A blanket impl lets plain closures act as handlers:
///
/// ```
/// use dns_capture::{DnsHandler, TransportMessage};
///
/// let mut seen = 0usize;
/// let mut handler = |_payload: &[u8], _tm: &TransportMessage| seen += 1;
/// fn takes_handler<H: DnsHandler>(_h: &mut H) {}
/// takes_handler(&mut handler);
/// ```
pub trait DnsHandler {
    fn handle_dns(&mut self, payload: &[u8], tm: &TransportMessage);
}

impl<F> DnsHandler for F
where
    F: FnMut(&[u8], &TransportMessage),
{
    fn handle_dns(&mut self, payload: &[u8], tm: &TransportMessage) {
        self(payload, tm)
    }
}
