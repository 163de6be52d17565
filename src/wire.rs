//! Wire-format header parsers for the demux path.
//!
//! Packet memory is never aligned, so every multi-byte field goes through
//! nom's byte-ordered readers instead of structural casts. Parsers consume
//! exactly the fixed part of each header; variable parts (IPv4 options, TCP
//! options, IPv6 extension headers) are skipped by the caller using the
//! decoded length fields.

use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::{be_u8, be_u16, be_u32, be_u128};
use std::net::{Ipv4Addr, Ipv6Addr};

pub(crate) const ETHER_HDR_LEN: usize = 14;
pub(crate) const ETHERTYPE_IP: u16 = 0x0800;
pub(crate) const ETHERTYPE_IPV6: u16 = 0x86dd;
pub(crate) const ETHERTYPE_8021Q: u16 = 0x8100;

pub(crate) const PPP_ADDRESS_VAL: u8 = 0xff;
pub(crate) const PPP_CONTROL_VAL: u8 = 0x03;
pub(crate) const PPP_IP: u16 = 0x0021;

pub(crate) const IPPROTO_HOPOPTS: u8 = 0;
pub(crate) const IPPROTO_TCP: u8 = 6;
pub(crate) const IPPROTO_UDP: u8 = 17;
pub(crate) const IPPROTO_ROUTING: u8 = 43;
pub(crate) const IPPROTO_FRAGMENT: u8 = 44;
pub(crate) const IPPROTO_ESP: u8 = 50;
pub(crate) const IPPROTO_AH: u8 = 51;
pub(crate) const IPPROTO_DSTOPTS: u8 = 60;

/// 13-bit IPv4 fragment offset mask.
pub(crate) const IP_OFFMASK: u16 = 0x1fff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    /// Raw fragment field: flags in the top 3 bits, offset below.
    pub frag: u16,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ipv6Header {
    pub payload_len: usize,
    pub next_header: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    /// Header length in bytes (data offset × 4).
    pub header_len: usize,
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
}

/// EtherType of an Ethernet frame; the 12 address bytes are skipped.
pub(crate) fn ethertype(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, _addrs) = take(12usize)(input)?;
    be_u16(input)
}

/// 802.1Q tag: the raw tag-control bytes and the encapsulated EtherType.
///
/// The tag bytes are returned undecoded; VLAN id extraction depends on a
/// configured byte-order toggle.
pub(crate) fn vlan_tag(input: &[u8]) -> IResult<&[u8], ([u8; 2], u16)> {
    let (input, tag) = take(2usize)(input)?;
    let (input, inner_type) = be_u16(input)?;
    Ok((input, ([tag[0], tag[1]], inner_type)))
}

pub(crate) fn ipv4_header(input: &[u8]) -> IResult<&[u8], Ipv4Header> {
    let (input, ver_ihl) = be_u8(input)?;
    let (input, _tos) = be_u8(input)?;
    let (input, total_len) = be_u16(input)?;
    let (input, _id) = be_u16(input)?;
    let (input, frag) = be_u16(input)?;
    let (input, _ttl) = be_u8(input)?;
    let (input, proto) = be_u8(input)?;
    let (input, _checksum) = be_u16(input)?;
    let (input, src) = be_u32(input)?;
    let (input, dst) = be_u32(input)?;
    Ok((
        input,
        Ipv4Header {
            header_len: ((ver_ihl & 0x0f) as usize) * 4,
            total_len: total_len as usize,
            frag,
            proto,
            src: Ipv4Addr::from(src),
            dst: Ipv4Addr::from(dst),
        },
    ))
}

pub(crate) fn ipv6_header(input: &[u8]) -> IResult<&[u8], Ipv6Header> {
    let (input, _ver_tc_flow) = be_u32(input)?;
    let (input, payload_len) = be_u16(input)?;
    let (input, next_header) = be_u8(input)?;
    let (input, _hop_limit) = be_u8(input)?;
    let (input, src) = be_u128(input)?;
    let (input, dst) = be_u128(input)?;
    Ok((
        input,
        Ipv6Header {
            payload_len: payload_len as usize,
            next_header,
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
        },
    ))
}

/// One IPv6 extension header: (next header, encoded length in bytes).
///
/// All allow-listed extensions use the options encoding where the length
/// field counts 8-byte units beyond the first.
pub(crate) fn ipv6_ext_header(input: &[u8]) -> IResult<&[u8], (u8, usize)> {
    let (input, next_header) = be_u8(input)?;
    let (input, len) = be_u8(input)?;
    Ok((input, (next_header, 8 * (len as usize + 1))))
}

pub(crate) fn udp_header(input: &[u8]) -> IResult<&[u8], UdpHeader> {
    let (input, src_port) = be_u16(input)?;
    let (input, dst_port) = be_u16(input)?;
    let (input, _length) = be_u16(input)?;
    let (input, _checksum) = be_u16(input)?;
    Ok((input, UdpHeader { src_port, dst_port }))
}

pub(crate) fn tcp_header(input: &[u8]) -> IResult<&[u8], TcpHeader> {
    let (input, src_port) = be_u16(input)?;
    let (input, dst_port) = be_u16(input)?;
    let (input, seq) = be_u32(input)?;
    let (input, _ack) = be_u32(input)?;
    let (input, data_offset) = be_u8(input)?;
    let (input, flags) = be_u8(input)?;
    let (input, _window) = be_u16(input)?;
    let (input, _checksum) = be_u16(input)?;
    let (input, _urgent) = be_u16(input)?;
    Ok((
        input,
        TcpHeader {
            src_port,
            dst_port,
            seq,
            header_len: ((data_offset >> 4) as usize) * 4,
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ethertype_after_addresses() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x08, 0x00, 0xaa]);
        let (rest, etype) = ethertype(&frame).unwrap();
        assert_eq!(etype, ETHERTYPE_IP);
        assert_eq!(rest, &[0xaa]);
    }

    #[test]
    fn parses_ipv4_header_fields() {
        let bytes = hex::decode("450000548ecc00004001f7cb0a0000010a000002").unwrap();
        let (rest, h) = ipv4_header(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(h.header_len, 20);
        assert_eq!(h.total_len, 0x54);
        assert_eq!(h.frag, 0);
        assert_eq!(h.proto, 1);
        assert_eq!(h.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(h.dst, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn parses_ipv6_header_fields() {
        let mut bytes = vec![0x60, 0, 0, 0, 0x00, 0x20, 17, 64];
        bytes.extend_from_slice(&[0; 15]);
        bytes.push(1); // src ::1
        bytes.extend_from_slice(&[0; 15]);
        bytes.push(2); // dst ::2
        let (_, h) = ipv6_header(&bytes).unwrap();
        assert_eq!(h.payload_len, 0x20);
        assert_eq!(h.next_header, IPPROTO_UDP);
        assert_eq!(h.src, Ipv6Addr::from(1u128));
        assert_eq!(h.dst, Ipv6Addr::from(2u128));
    }

    #[test]
    fn ext_header_length_encoding() {
        let (_, (next, len)) = ipv6_ext_header(&[IPPROTO_TCP, 0]).unwrap();
        assert_eq!((next, len), (IPPROTO_TCP, 8));
        let (_, (_, len)) = ipv6_ext_header(&[IPPROTO_UDP, 3]).unwrap();
        assert_eq!(len, 32);
    }

    #[test]
    fn parses_tcp_flags_and_offset() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&33000u16.to_be_bytes());
        bytes.extend_from_slice(&53u16.to_be_bytes());
        bytes.extend_from_slice(&1000u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.push(0x60); // data offset 6 -> 24 bytes
        bytes.push(0x02 | 0x01); // SYN + FIN
        bytes.extend_from_slice(&[0; 6]);
        let (_, h) = tcp_header(&bytes).unwrap();
        assert_eq!(h.src_port, 33000);
        assert_eq!(h.dst_port, 53);
        assert_eq!(h.seq, 1000);
        assert_eq!(h.header_len, 24);
        assert!(h.syn && h.fin && !h.rst);
    }

    #[test]
    fn short_input_is_an_error() {
        assert!(ipv4_header(&[0x45, 0x00]).is_err());
        assert!(tcp_header(&[0; 10]).is_err());
        assert!(udp_header(&[0; 7]).is_err());
    }
}
