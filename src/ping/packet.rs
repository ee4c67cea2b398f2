//! ICMP echo packet construction and reply parsing
//!
//! Builds the echo requests sent by the probers and decodes inbound
//! datagrams down to the echo reply's sequence number. Matching replies to
//! probes uses the sequence number only: unprivileged DGRAM ICMP sockets
//! rewrite the identifier on Linux, so it cannot be relied on.

use crate::relays::IpVersion;
use pnet::packet::icmp::{echo_reply, echo_request, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{self, Icmpv6Packet, Icmpv6Types};
use pnet::packet::Packet;
use pnet::util::checksum;

/// Fixed payload carried in every echo request.
pub const ECHO_PAYLOAD: &[u8] = b"relay-compass";

/// A decoded inbound echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    /// Sequence number echoed back by the peer.
    pub sequence: u16,
}

/// Serialize an echo request for the given family.
pub fn build_echo_request(ip_version: IpVersion, identifier: u16, sequence: u16) -> Vec<u8> {
    match ip_version {
        IpVersion::V4 => build_v4(identifier, sequence),
        IpVersion::V6 => build_v6(identifier, sequence),
    }
}

fn build_v4(identifier: u16, sequence: u16) -> Vec<u8> {
    let size = echo_request::MutableEchoRequestPacket::minimum_packet_size() + ECHO_PAYLOAD.len();
    let mut buf = vec![0u8; size];
    {
        let mut packet = echo_request::MutableEchoRequestPacket::new(&mut buf)
            .expect("buffer sized from minimum_packet_size");
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(pnet::packet::icmp::IcmpCode(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(ECHO_PAYLOAD);
        let sum = checksum(packet.packet(), 1);
        packet.set_checksum(sum);
    }
    buf
}

fn build_v6(identifier: u16, sequence: u16) -> Vec<u8> {
    let size =
        icmpv6::echo_request::MutableEchoRequestPacket::minimum_packet_size() + ECHO_PAYLOAD.len();
    let mut buf = vec![0u8; size];
    {
        let mut packet = icmpv6::echo_request::MutableEchoRequestPacket::new(&mut buf)
            .expect("buffer sized from minimum_packet_size");
        packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
        packet.set_icmpv6_code(icmpv6::Icmpv6Code(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(ECHO_PAYLOAD);
        // The kernel computes the ICMPv6 checksum (it needs the pseudo
        // header) for both DGRAM and raw ICMPv6 sockets.
    }
    buf
}

/// Decode an inbound datagram as an echo reply for the given family.
///
/// Returns `None` for anything that is not a well-formed echo reply; the
/// reader loop treats that as stray traffic and moves on.
pub fn parse_echo_reply(ip_version: IpVersion, datagram: &[u8]) -> Option<EchoReply> {
    match ip_version {
        IpVersion::V4 => parse_v4(datagram),
        IpVersion::V6 => parse_v6(datagram),
    }
}

fn parse_v4(datagram: &[u8]) -> Option<EchoReply> {
    // Raw sockets and BSD DGRAM sockets deliver the IPv4 header; Linux
    // DGRAM sockets deliver the bare ICMP message. Detect the header by
    // its version nibble and skip it.
    let first = *datagram.first()?;
    let icmp_bytes = if first >> 4 == 4 {
        let header_len = usize::from(first & 0x0f) * 4;
        datagram.get(header_len..)?
    } else {
        datagram
    };

    let packet = IcmpPacket::new(icmp_bytes)?;
    if packet.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let reply = echo_reply::EchoReplyPacket::new(icmp_bytes)?;
    Some(EchoReply {
        sequence: reply.get_sequence_number(),
    })
}

fn parse_v6(datagram: &[u8]) -> Option<EchoReply> {
    // ICMPv6 sockets never deliver the IPv6 header.
    let packet = Icmpv6Packet::new(datagram)?;
    if packet.get_icmpv6_type() != Icmpv6Types::EchoReply {
        return None;
    }
    let reply = icmpv6::echo_reply::EchoReplyPacket::new(datagram)?;
    Some(EchoReply {
        sequence: reply.get_sequence_number(),
    })
}
