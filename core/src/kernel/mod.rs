//! Kernel I/O adapter (spec.md §4.1).
//!
//! Owns the userspace end of the kernel's packet-queue, conntrack, and
//! netfilter-log sockets. The pure decode/guard logic lives here so it is
//! testable without a real netlink socket; `queue`, `conntrack`, and
//! `netlog` wrap the actual transports (`nfq`, hand-rolled netlink
//! attribute decoding, and `nflog` respectively).

pub mod conntrack;
pub mod netlog;
pub mod queue;

use std::net::IpAddr;

use sentry_common::{FiveTuple, Verdict};

/// Smallest IPv4 header a packet can plausibly carry; shorter frames are
/// accepted with mark 0 and counted as garbage (spec.md §4.1, §8).
pub const MIN_FRAME_LEN: usize = 20;

/// A decoded packet-queue event, ready for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub queue_index: usize,
    pub nfid: u32,
    pub ctid: Option<u32>,
    pub family: u8,
    pub payload: Vec<u8>,
}

/// Outcome of the packet-length and L3-family guard (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Too short to carry a usable IP header.
    Short,
    /// First nibble isn't 4 (IPv4) or 6 (IPv6).
    UnknownFamily(u8),
    /// Long enough, family recognized.
    Ok { family: u8 },
}

/// Frames shorter than 20 octets or with an unrecognized first-nibble
/// version are accepted with mark 0 and counted, never reaching the
/// dispatch pipeline (spec.md §4.1, §7, §8 boundary behaviors).
pub fn guard_frame(payload: &[u8]) -> GuardOutcome {
    if payload.len() < MIN_FRAME_LEN {
        return GuardOutcome::Short;
    }
    match payload[0] >> 4 {
        4 => GuardOutcome::Ok { family: libc::AF_INET as u8 },
        6 => GuardOutcome::Ok { family: libc::AF_INET6 as u8 },
        other => GuardOutcome::UnknownFamily(other),
    }
}

/// Pre-pipeline verdict for a packet that never reaches dispatch (short
/// frame, unknown family, or missing conntrack id): always accept, mark 0.
pub fn early_accept() -> (Verdict, u32) {
    (Verdict::Accept, 0)
}

/// Derives the flow's five-tuple directly from the packet's own IP/L4
/// headers (nfq hands back the raw L3 packet, not a pre-parsed tuple).
/// `None` means the header was too short or missing one of the fields
/// the tuple requires; callers fall back to `early_accept`.
pub fn extract_five_tuple(payload: &[u8]) -> Option<FiveTuple> {
    let (protocol, client_addr, server_addr, client_port, server_port, _icmp_type) =
        netlog::decode_ip_payload(payload);
    Some(FiveTuple {
        protocol,
        client_addr: client_addr?,
        client_port: client_port.unwrap_or(0),
        server_addr: server_addr?,
        server_port: server_port.unwrap_or(0),
    })
}

/// Encodes a five-tuple into the same minimal IPv4/IPv6-plus-ports shape
/// `extract_five_tuple` decodes. Conntrack NEW events carry a tuple but no
/// raw packet of their own, so capturing one for replay (spec.md §4.7)
/// needs a synthetic header that round-trips through the same decode
/// path live packets use. Mixed-family tuples cannot occur in practice
/// (a flow's client and server share an IP version) and encode as empty.
pub fn encode_five_tuple_header(tuple: &FiveTuple) -> Vec<u8> {
    match (tuple.client_addr, tuple.server_addr) {
        (IpAddr::V4(client), IpAddr::V4(server)) => {
            let mut buf = vec![0u8; 20 + 4];
            buf[0] = 0x45;
            buf[9] = tuple.protocol.number();
            buf[12..16].copy_from_slice(&client.octets());
            buf[16..20].copy_from_slice(&server.octets());
            buf[20..22].copy_from_slice(&tuple.client_port.to_be_bytes());
            buf[22..24].copy_from_slice(&tuple.server_port.to_be_bytes());
            buf
        }
        (IpAddr::V6(client), IpAddr::V6(server)) => {
            let mut buf = vec![0u8; 40 + 4];
            buf[0] = 0x60;
            buf[6] = tuple.protocol.number();
            buf[8..24].copy_from_slice(&client.octets());
            buf[24..40].copy_from_slice(&server.octets());
            buf[40..42].copy_from_slice(&tuple.client_port.to_be_bytes());
            buf[42..44].copy_from_slice(&tuple.server_port.to_be_bytes());
            buf
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_short_frames() {
        assert_eq!(guard_frame(&[0u8; 10]), GuardOutcome::Short);
    }

    #[test]
    fn guard_accepts_ipv4_and_ipv6() {
        assert_eq!(guard_frame(&[0x45; MIN_FRAME_LEN]), GuardOutcome::Ok { family: libc::AF_INET as u8 });
        assert_eq!(guard_frame(&[0x60; MIN_FRAME_LEN]), GuardOutcome::Ok { family: libc::AF_INET6 as u8 });
    }

    #[test]
    fn guard_rejects_unknown_family() {
        assert_eq!(guard_frame(&[0x90; MIN_FRAME_LEN]), GuardOutcome::UnknownFamily(9));
    }

    #[test]
    fn extracts_tuple_from_raw_ipv4_tcp_packet() {
        let mut packet = vec![0u8; 20 + 20];
        packet[0] = 0x45;
        packet[9] = 6;
        packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
        packet[16..20].copy_from_slice(&[203, 0, 113, 10]);
        packet[20..22].copy_from_slice(&51000u16.to_be_bytes());
        packet[22..24].copy_from_slice(&443u16.to_be_bytes());

        let tuple = extract_five_tuple(&packet).unwrap();
        assert_eq!(tuple.server_port, 443);
        assert_eq!(tuple.client_port, 51000);
    }

    #[test]
    fn encoded_tuple_round_trips_through_extract() {
        use sentry_common::Protocol;
        use std::net::Ipv4Addr;

        let tuple = FiveTuple {
            protocol: Protocol::Tcp,
            client_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 51000,
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port: 443,
        };

        let header = encode_five_tuple_header(&tuple);
        let decoded = extract_five_tuple(&header).unwrap();
        assert_eq!(decoded, tuple);
    }
}
