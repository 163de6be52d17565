//! Frame-to-DNS demultiplexing.
//!
//! One [`Demux`] peels off the datalink, IP and transport layers of every
//! captured frame and routes DNS payloads to the handler: UDP datagrams go
//! straight through, TCP segments go through the [`TcpReassembler`].
//! Malformed, fragmented and unwanted packets are dropped without feedback;
//! the only trace they leave is the gap between the kernel's received
//! counter and `pkts_captured`.

use crate::tcp::{SegmentHeader, TcpReassembler};
use crate::transport::{DnsHandler, Proto, TransportMessage};
use crate::wire::{
    self, ETHERTYPE_8021Q, ETHERTYPE_IP, ETHERTYPE_IPV6, IP_OFFMASK, IPPROTO_AH, IPPROTO_DSTOPTS,
    IPPROTO_ESP, IPPROTO_FRAGMENT, IPPROTO_HOPOPTS, IPPROTO_ROUTING, IPPROTO_TCP, IPPROTO_UDP,
    PPP_ADDRESS_VAL, PPP_CONTROL_VAL, PPP_IP,
};
use log::{debug, trace};
use std::net::IpAddr;

/// Most VLAN ids accepted into the allow-list; later additions are ignored.
const MAX_VLAN_IDS: usize = 100;

/// IPv6 extension headers the decoder walks through. Fragment is listed so
/// the walk recognizes it, but a fragmented packet is always rejected.
/// AH and ESP are traversed with the options-header length encoding, as the
/// ESP layout cannot be parsed without the security association anyway.
const IPV6_EXTENSION_HEADERS: [u8; 6] = [
    IPPROTO_HOPOPTS,
    IPPROTO_ROUTING,
    IPPROTO_FRAGMENT,
    IPPROTO_DSTOPTS,
    IPPROTO_AH,
    IPPROTO_ESP,
];

/// Datalink decoder selected per capture source from the reported link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatalinkType {
    Ethernet,
    Ppp,
    Null,
    Loop,
    Raw,
}

/// The per-frame decode pipeline and its configuration.
pub struct Demux {
    dns_port: u16,
    vlan_ids: Vec<u16>,
    vlan_tag_byte_order_conversion: bool,
    tcp: TcpReassembler,
}

impl Demux {
    pub fn new(dns_port: u16) -> Self {
        Self {
            dns_port,
            vlan_ids: Vec::new(),
            vlan_tag_byte_order_conversion: true,
            tcp: TcpReassembler::new(dns_port),
        }
    }

    /// Restrict capture to the given VLAN id. An empty allow-list accepts
    /// every frame; ids beyond the table bound are ignored.
    pub fn add_vlan_id(&mut self, vlan: u16) {
        if self.vlan_ids.len() >= MAX_VLAN_IDS {
            debug!("vlan allow-list full, ignoring {vlan}");
            return;
        }
        self.vlan_ids.push(vlan & 0xfff);
    }

    /// Whether the 802.1Q tag-control field is read big-endian (the
    /// default) or in host order.
    pub fn set_vlan_tag_byte_order_conversion(&mut self, convert: bool) {
        self.vlan_tag_byte_order_conversion = convert;
    }

    pub fn tcp(&self) -> &TcpReassembler {
        &self.tcp
    }

    /// Drop TCP flows idle since before `threshold`.
    pub fn expire_flows(&mut self, threshold: i64) {
        self.tcp.expire_older_than(threshold);
    }

    /// Decode one captured frame and deliver any DNS payload it completes.
    pub fn handle_frame<H: DnsHandler>(
        &mut self,
        datalink: DatalinkType,
        frame: &[u8],
        ts_sec: i64,
        ts_usec: i64,
        handler: &mut H,
    ) {
        if frame.len() < wire::ETHER_HDR_LEN {
            return;
        }
        let mut tm = TransportMessage::new(ts_sec, ts_usec);
        match datalink {
            DatalinkType::Ethernet => self.handle_ether(frame, &mut tm, handler),
            DatalinkType::Ppp => self.handle_ppp(frame, &mut tm, handler),
            DatalinkType::Null | DatalinkType::Loop => self.handle_null(frame, &mut tm, handler),
            DatalinkType::Raw => self.handle_ip(frame, &mut tm, handler),
        }
    }

    fn match_vlan(&self, tag: [u8; 2]) -> bool {
        if self.vlan_ids.is_empty() {
            return true;
        }
        let vlan = if self.vlan_tag_byte_order_conversion {
            u16::from_be_bytes(tag) & 0xfff
        } else {
            u16::from_ne_bytes(tag) & 0xfff
        };
        trace!("vlan is {vlan}");
        self.vlan_ids.contains(&vlan)
    }

    fn handle_ether<H: DnsHandler>(
        &mut self,
        frame: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        let Ok((mut pkt, mut etype)) = wire::ethertype(frame) else {
            return;
        };
        if etype == ETHERTYPE_8021Q {
            let Ok((rest, (tag, inner_type))) = wire::vlan_tag(pkt) else {
                return;
            };
            if !self.match_vlan(tag) {
                return;
            }
            etype = inner_type;
            pkt = rest;
        }
        if is_ethertype_ip(etype) {
            self.handle_ip(pkt, tm, handler);
        }
    }

    fn handle_ppp<H: DnsHandler>(
        &mut self,
        frame: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        let mut pkt = frame;
        if pkt.len() < 2 {
            return;
        }
        if pkt[0] == PPP_ADDRESS_VAL && pkt[1] == PPP_CONTROL_VAL {
            pkt = &pkt[2..]; // address/control field compression not in use
        }
        if pkt.len() < 2 {
            return;
        }
        let proto = if pkt[0] % 2 == 1 {
            // protocol field compression
            let proto = pkt[0] as u16;
            pkt = &pkt[1..];
            proto
        } else {
            let proto = u16::from_be_bytes([pkt[0], pkt[1]]);
            pkt = &pkt[2..];
            proto
        };
        if is_ethertype_ip(proto) {
            self.handle_ip(pkt, tm, handler);
        }
    }

    fn handle_null<H: DnsHandler>(
        &mut self,
        frame: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        if frame.len() < 4 {
            return;
        }
        // host-order address family prefix
        let family = u32::from_ne_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if family == libc::AF_INET as u32 || family == libc::AF_INET6 as u32 {
            self.handle_ip(&frame[4..], tm, handler);
        }
    }

    fn handle_ip<H: DnsHandler>(
        &mut self,
        pkt: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        // the header is not guaranteed aligned; dispatch on the raw byte
        match pkt.first().map(|b| b >> 4) {
            Some(4) => self.handle_ipv4(pkt, tm, handler),
            Some(6) => self.handle_ipv6(pkt, tm, handler),
            _ => {}
        }
    }

    fn handle_ipv4<H: DnsHandler>(
        &mut self,
        pkt: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        let Ok((_, ip)) = wire::ipv4_header(pkt) else {
            return;
        };
        tm.src_ip = IpAddr::V4(ip.src);
        tm.dst_ip = IpAddr::V4(ip.dst);

        // punt on IP fragments
        if ip.frag & IP_OFFMASK != 0 {
            return;
        }
        // downstream lengths come from the IP header, not caplen
        if ip.total_len > pkt.len() {
            return; // truncated capture
        }
        let Some(payload) = pkt.get(ip.header_len..ip.total_len) else {
            return;
        };
        match ip.proto {
            IPPROTO_UDP => {
                tm.proto = Proto::Udp;
                self.handle_udp(payload, tm, handler);
            }
            IPPROTO_TCP => {
                tm.proto = Proto::Tcp;
                self.handle_tcp(payload, tm, handler);
            }
            _ => {}
        }
    }

    fn handle_ipv6<H: DnsHandler>(
        &mut self,
        pkt: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        let Ok((_, ip)) = wire::ipv6_header(pkt) else {
            return;
        };
        let mut offset = 40usize;
        let mut payload_len = ip.payload_len;
        let mut next_header = ip.next_header;

        while IPV6_EXTENSION_HEADERS.contains(&next_header) {
            // cannot handle fragments
            if next_header == IPPROTO_FRAGMENT {
                return;
            }
            let Some(ext) = pkt.get(offset..) else {
                return;
            };
            let Ok((_, (nh, ext_len))) = wire::ipv6_ext_header(ext) else {
                return;
            };
            // an extension longer than the payload means a broken packet
            if ext_len > payload_len {
                return;
            }
            next_header = nh;
            offset += ext_len;
            payload_len -= ext_len;
        }

        tm.src_ip = IpAddr::V6(ip.src);
        tm.dst_ip = IpAddr::V6(ip.dst);

        if payload_len == 0 {
            return;
        }
        let Some(payload) = pkt.get(offset..offset + payload_len) else {
            return; // truncated or broken
        };
        match next_header {
            IPPROTO_UDP => {
                tm.proto = Proto::Udp;
                self.handle_udp(payload, tm, handler);
            }
            IPPROTO_TCP => {
                tm.proto = Proto::Tcp;
                self.handle_tcp(payload, tm, handler);
            }
            _ => {}
        }
    }

    fn handle_udp<H: DnsHandler>(
        &mut self,
        payload: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        let Ok((dns, udp)) = wire::udp_header(payload) else {
            return;
        };
        tm.src_port = udp.src_port;
        tm.dst_port = udp.dst_port;
        if self.dns_port != tm.src_port && self.dns_port != tm.dst_port {
            return;
        }
        handler.handle_dns(dns, tm);
    }

    fn handle_tcp<H: DnsHandler>(
        &mut self,
        payload: &[u8],
        tm: &mut TransportMessage,
        handler: &mut H,
    ) {
        let Ok((_, tcp)) = wire::tcp_header(payload) else {
            return;
        };
        if tcp.header_len < 20 {
            return;
        }
        tm.src_port = tcp.src_port;
        tm.dst_port = tcp.dst_port;
        let Some(segment) = payload.get(tcp.header_len..) else {
            return;
        };
        let seg = SegmentHeader {
            seq: tcp.seq,
            fin: tcp.fin,
            syn: tcp.syn,
            rst: tcp.rst,
        };
        self.tcp.process_segment(tm, &seg, segment, handler);
    }
}

fn is_ethertype_ip(proto: u16) -> bool {
    proto == ETHERTYPE_IP || proto == ETHERTYPE_IPV6 || proto == PPP_IP
}
