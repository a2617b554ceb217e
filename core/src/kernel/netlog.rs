//! NFLOG transport (spec.md §4.1, §6 log records).
//!
//! Wraps the `nflog` crate's group socket. Records are decoded into a
//! plain struct so the rest of the engine never touches the crate's
//! borrowed message type directly.

use std::net::IpAddr;
use std::sync::Arc;

use nflog::{Group, Message as NflogMessage};
use sentry_common::Protocol;

use crate::error::StartupError;

/// One decoded NFLOG record (spec.md §6: family, protocol, interfaces,
/// addresses, ports, ICMP type, mark, prefix).
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub prefix: String,
    pub mark: u32,
    pub in_interface: Option<u32>,
    pub out_interface: Option<u32>,
    pub protocol: Protocol,
    pub client_addr: Option<IpAddr>,
    pub server_addr: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub server_port: Option<u16>,
    pub icmp_type: Option<u8>,
}

fn decode_message(message: &NflogMessage) -> LogRecord {
    let payload = message.get_payload();
    let (protocol, client_addr, server_addr, client_port, server_port, icmp_type) =
        decode_ip_payload(payload);

    LogRecord {
        prefix: message.get_prefix().unwrap_or_default(),
        mark: message.get_mark().unwrap_or(0),
        in_interface: message.get_indev(),
        out_interface: message.get_outdev(),
        protocol,
        client_addr,
        server_addr,
        client_port,
        server_port,
        icmp_type,
    }
}

/// Parses the raw IP payload NFLOG hands back (no link-layer header)
/// far enough to pull out the fields the session attribute set needs.
/// Anything shorter than a minimal header yields all-`None` fields
/// rather than erroring — a log record is best-effort by nature.
pub(crate) fn decode_ip_payload(
    payload: &[u8],
) -> (Protocol, Option<IpAddr>, Option<IpAddr>, Option<u16>, Option<u16>, Option<u8>) {
    if payload.is_empty() {
        return (Protocol::Other(0), None, None, None, None, None);
    }
    match payload[0] >> 4 {
        4 => decode_ipv4(payload),
        6 => decode_ipv6(payload),
        _ => (Protocol::Other(0), None, None, None, None, None),
    }
}

fn decode_ipv4(
    payload: &[u8],
) -> (Protocol, Option<IpAddr>, Option<IpAddr>, Option<u16>, Option<u16>, Option<u8>) {
    if payload.len() < 20 {
        return (Protocol::Other(0), None, None, None, None, None);
    }
    let ihl = (payload[0] & 0x0F) as usize * 4;
    let protocol = Protocol::from_number(payload[9]);
    let client_addr = Some(IpAddr::V4(std::net::Ipv4Addr::new(
        payload[12],
        payload[13],
        payload[14],
        payload[15],
    )));
    let server_addr = Some(IpAddr::V4(std::net::Ipv4Addr::new(
        payload[16],
        payload[17],
        payload[18],
        payload[19],
    )));

    if payload.len() < ihl + 4 {
        return (protocol, client_addr, server_addr, None, None, None);
    }
    decode_l4(protocol, &payload[ihl..], client_addr, server_addr)
}

fn decode_ipv6(
    payload: &[u8],
) -> (Protocol, Option<IpAddr>, Option<IpAddr>, Option<u16>, Option<u16>, Option<u8>) {
    if payload.len() < 40 {
        return (Protocol::Other(0), None, None, None, None, None);
    }
    let protocol = Protocol::from_number(payload[6]);
    let mut src = [0u8; 16];
    src.copy_from_slice(&payload[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&payload[24..40]);
    let client_addr = Some(IpAddr::V6(std::net::Ipv6Addr::from(src)));
    let server_addr = Some(IpAddr::V6(std::net::Ipv6Addr::from(dst)));

    if payload.len() < 44 {
        return (protocol, client_addr, server_addr, None, None, None);
    }
    decode_l4(protocol, &payload[40..], client_addr, server_addr)
}

fn decode_l4(
    protocol: Protocol,
    l4: &[u8],
    client_addr: Option<IpAddr>,
    server_addr: Option<IpAddr>,
) -> (Protocol, Option<IpAddr>, Option<IpAddr>, Option<u16>, Option<u16>, Option<u8>) {
    match protocol {
        Protocol::Tcp | Protocol::Udp if l4.len() >= 4 => {
            let client_port = Some(u16::from_be_bytes([l4[0], l4[1]]));
            let server_port = Some(u16::from_be_bytes([l4[2], l4[3]]));
            (protocol, client_addr, server_addr, client_port, server_port, None)
        }
        Protocol::Icmp | Protocol::Icmpv6 if !l4.is_empty() => {
            (protocol, client_addr, server_addr, None, None, Some(l4[0]))
        }
        _ => (protocol, client_addr, server_addr, None, None, None),
    }
}

/// Owns one NFLOG group subscription and hands decoded records to the
/// supplied callback, mirroring `Group::set_callback`'s push model.
pub struct NetlogWorker {
    group: Group,
}

impl NetlogWorker {
    /// `on_record` receives the decoded record plus the raw IP payload, so
    /// callers that only need the capture tap (spec.md §4.7, origin `L`)
    /// don't have to re-derive it from the decoded fields.
    pub fn open(
        group_num: u16,
        on_record: Arc<dyn Fn(LogRecord, Vec<u8>) + Send + Sync>,
    ) -> Result<Self, StartupError> {
        let mut group = Group::new(nflog::Queue::open().map_err(StartupError::NetlogOpen)?)
            .map_err(StartupError::NetlogOpen)?;
        group
            .bind(group_num)
            .map_err(StartupError::NetlogOpen)?;
        group.set_callback(move |message| {
            let payload = message.get_payload().to_vec();
            on_record(decode_message(&message), payload);
        });
        Ok(NetlogWorker { group })
    }

    /// Runs the blocking receive loop; intended to be spawned on a
    /// dedicated blocking thread by the orchestrator.
    pub fn run(&mut self) {
        self.group.run_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ipv4_tcp_header() {
        let mut payload = vec![0u8; 20 + 4];
        payload[0] = 0x45; // version 4, IHL 5
        payload[9] = 6; // TCP
        payload[12..16].copy_from_slice(&[10, 0, 0, 1]);
        payload[16..20].copy_from_slice(&[203, 0, 113, 10]);
        payload[20..22].copy_from_slice(&51000u16.to_be_bytes());
        payload[22..24].copy_from_slice(&443u16.to_be_bytes());

        let (protocol, client, server, client_port, server_port, icmp) = decode_ip_payload(&payload);
        assert_eq!(protocol, Protocol::Tcp);
        assert_eq!(client, Some(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(server, Some(IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 10))));
        assert_eq!(client_port, Some(51000));
        assert_eq!(server_port, Some(443));
        assert_eq!(icmp, None);
    }

    #[test]
    fn short_payload_yields_all_none_rather_than_panicking() {
        let (protocol, client, server, client_port, server_port, icmp) = decode_ip_payload(&[0x45, 0, 0]);
        assert_eq!(protocol, Protocol::Other(0));
        assert_eq!(client, None);
        assert_eq!(server, None);
        assert_eq!(client_port, None);
        assert_eq!(server_port, None);
        assert_eq!(icmp, None);
    }

    #[test]
    fn decodes_icmp_type() {
        let mut payload = vec![0u8; 20 + 1];
        payload[0] = 0x45;
        payload[9] = 1; // ICMP
        payload[12..16].copy_from_slice(&[10, 0, 0, 1]);
        payload[16..20].copy_from_slice(&[10, 0, 0, 2]);
        payload[20] = 8; // echo request

        let (protocol, _, _, _, _, icmp) = decode_ip_payload(&payload);
        assert_eq!(protocol, Protocol::Icmp);
        assert_eq!(icmp, Some(8));
    }
}
