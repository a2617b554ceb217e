//! Conntrack netlink transport (spec.md §4.1, §6).
//!
//! Speaks `NETLINK_NETFILTER` directly: a small netlink-attribute (NLA)
//! walker decodes NEW/UPDATE/DESTROY event payloads and full-table dumps,
//! in the same style real conntrack tooling hand-rolls this protocol
//! rather than pulling in a full netlink-route stack for a handful of
//! attribute types.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sentry_common::{FiveTuple, Protocol};

use crate::error::KernelError;

const NFNL_SUBSYS_CTNETLINK: u8 = 1;
pub const IPCTNL_MSG_CT_NEW: u8 = 0;
pub const IPCTNL_MSG_CT_GET: u8 = 1;
pub const IPCTNL_MSG_CT_DELETE: u8 = 2;

pub const NFNLGRP_CONNTRACK_NEW: u32 = 1;
pub const NFNLGRP_CONNTRACK_UPDATE: u32 = 2;
pub const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_DUMP: u16 = 0x300;
const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_STATUS: u16 = 3;
const CTA_MARK: u16 = 8;
const CTA_ID: u16 = 12;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

/// Kind of conntrack event observed on the multicast groups
/// (spec.md §3 Session lifecycle, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackEventKind {
    New,
    Update,
    Destroy,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConntrackEvent {
    pub kind: ConntrackEventKind,
    pub ctid: Option<u32>,
    pub tuple: Option<FiveTuple>,
    pub mark: Option<u32>,
}

/// Builds a `IPCTNL_MSG_CT_GET` dump request (spec.md §4.1 `dump_conntrack`).
pub fn build_dump_request(family: u8, seq: u32, pid: u32) -> Vec<u8> {
    let msg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | (IPCTNL_MSG_CT_GET as u16);
    let mut buf = Vec::with_capacity(NLMSG_HDRLEN + NFGENMSG_LEN);
    buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched below
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&pid.to_ne_bytes());
    buf.push(family);
    buf.push(0); // version
    buf.extend_from_slice(&0u16.to_ne_bytes()); // res_id
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
    buf
}

/// Builds an `IPCTNL_MSG_CT_NEW` request that clones the live entry at
/// `ctid` with a mutated mark (spec.md §4.1 `rewrite_conntrack_mark`:
/// "atomically clones the live conntrack entry, applies the mask fold,
/// and re-queries the subsystem").
pub fn build_mark_rewrite_request(ctid: u32, new_mark: u32, seq: u32, pid: u32) -> Vec<u8> {
    let msg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | (IPCTNL_MSG_CT_NEW as u16);
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_CREATE).to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&pid.to_ne_bytes());
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0);
    buf.extend_from_slice(&0u16.to_ne_bytes());

    push_nla(&mut buf, CTA_ID, &ctid.to_be_bytes());
    push_nla(&mut buf, CTA_MARK, &new_mark.to_be_bytes());

    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
    buf
}

fn push_nla(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let len = (4 + value.len()) as u16;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&attr_type.to_le_bytes());
    buf.extend_from_slice(value);
    let padding = ((len as usize + 3) & !3) - len as usize;
    buf.extend(std::iter::repeat(0u8).take(padding));
}

/// Parses one netlink attribute header + payload, advancing `input`.
/// Attribute bodies that claim more bytes than remain in the buffer are
/// rejected as malformed rather than read out of bounds.
fn parse_nla<'a>(input: &mut &'a [u8]) -> Option<(u16, &'a [u8])> {
    if input.len() < 4 {
        return None;
    }
    let len = u16::from_le_bytes([input[0], input[1]]) as usize;
    let attr_type = u16::from_le_bytes([input[2], input[3]]);
    if len < 4 {
        return None;
    }
    let payload_len = len - 4;
    if input.len() < 4 + payload_len {
        return None;
    }
    let payload = &input[4..4 + payload_len];
    let aligned = (len + 3) & !3;
    *input = &input[aligned.min(input.len())..];
    Some((attr_type & 0x7FFF, payload))
}

fn parse_tuple_ip(data: &[u8], client: &mut Option<IpAddr>, server: &mut Option<IpAddr>) {
    let mut input = data;
    while let Some((attr_type, attr_data)) = parse_nla(&mut input) {
        match attr_type {
            CTA_IP_V4_SRC if attr_data.len() >= 4 => {
                *client = Some(IpAddr::V4(Ipv4Addr::new(
                    attr_data[0],
                    attr_data[1],
                    attr_data[2],
                    attr_data[3],
                )));
            }
            CTA_IP_V4_DST if attr_data.len() >= 4 => {
                *server = Some(IpAddr::V4(Ipv4Addr::new(
                    attr_data[0],
                    attr_data[1],
                    attr_data[2],
                    attr_data[3],
                )));
            }
            CTA_IP_V6_SRC if attr_data.len() >= 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&attr_data[..16]);
                *client = Some(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            CTA_IP_V6_DST if attr_data.len() >= 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&attr_data[..16]);
                *server = Some(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }
}

fn parse_tuple_proto(data: &[u8]) -> (Protocol, Option<u16>, Option<u16>) {
    let mut input = data;
    let mut proto = Protocol::Other(0);
    let mut client_port = None;
    let mut server_port = None;
    while let Some((attr_type, attr_data)) = parse_nla(&mut input) {
        match attr_type {
            CTA_PROTO_NUM if !attr_data.is_empty() => proto = Protocol::from_number(attr_data[0]),
            CTA_PROTO_SRC_PORT if attr_data.len() >= 2 => {
                client_port = Some(u16::from_be_bytes([attr_data[0], attr_data[1]]));
            }
            CTA_PROTO_DST_PORT if attr_data.len() >= 2 => {
                server_port = Some(u16::from_be_bytes([attr_data[0], attr_data[1]]));
            }
            _ => {}
        }
    }
    (proto, client_port, server_port)
}

fn parse_tuple(data: &[u8]) -> Option<FiveTuple> {
    let mut input = data;
    let mut client_addr = None;
    let mut server_addr = None;
    let mut proto = Protocol::Other(0);
    let mut client_port = None;
    let mut server_port = None;

    while let Some((attr_type, attr_data)) = parse_nla(&mut input) {
        match attr_type {
            CTA_TUPLE_IP => parse_tuple_ip(attr_data, &mut client_addr, &mut server_addr),
            CTA_TUPLE_PROTO => {
                let (p, cp, sp) = parse_tuple_proto(attr_data);
                proto = p;
                client_port = cp;
                server_port = sp;
            }
            _ => {}
        }
    }

    Some(FiveTuple {
        protocol: proto,
        client_addr: client_addr?,
        client_port: client_port.unwrap_or(0),
        server_addr: server_addr?,
        server_port: server_port.unwrap_or(0),
    })
}

/// Decodes one conntrack netlink message (header + attribute stream)
/// into an event. Malformed message types/attributes are counted as
/// garbage by the caller, not here (spec.md §7).
pub fn decode_event(kind: ConntrackEventKind, data: &[u8]) -> Result<ConntrackEvent, KernelError> {
    if data.len() < NLMSG_HDRLEN + NFGENMSG_LEN {
        return Err(KernelError::MalformedConntrack("frame too short".to_string()));
    }
    let mut input = &data[NLMSG_HDRLEN + NFGENMSG_LEN..];

    let mut ctid = None;
    let mut tuple = None;
    let mut mark = None;

    while input.len() >= 4 {
        let (attr_type, attr_data) = match parse_nla(&mut input) {
            Some(v) => v,
            None => break,
        };
        match attr_type {
            CTA_ID if attr_data.len() >= 4 => {
                ctid = Some(u32::from_be_bytes([
                    attr_data[0],
                    attr_data[1],
                    attr_data[2],
                    attr_data[3],
                ]));
            }
            CTA_TUPLE_ORIG => tuple = parse_tuple(attr_data),
            CTA_MARK if attr_data.len() >= 4 => {
                mark = Some(u32::from_be_bytes([
                    attr_data[0],
                    attr_data[1],
                    attr_data[2],
                    attr_data[3],
                ]));
            }
            CTA_STATUS => {}
            _ => {}
        }
    }

    Ok(ConntrackEvent {
        kind,
        ctid,
        tuple,
        mark,
    })
}

/// `NETLINK_NETFILTER`'s protocol number (`linux/netlink.h`); not present
/// in `netlink-sys`'s own protocol constants since it has no rtnetlink
/// family association.
const NETLINK_NETFILTER: isize = 12;

const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

/// Owns the raw `NETLINK_NETFILTER` socket backing the conntrack event
/// stream and on-demand dumps/mark rewrites.
pub struct ConntrackSocket {
    socket: netlink_sys::Socket,
    seq: u32,
}

impl ConntrackSocket {
    /// Opens the socket and subscribes to `groups` (bitwise-OR of
    /// `NFNLGRP_CONNTRACK_*` group numbers shifted into the multicast
    /// mask, per `netlink(7)`).
    pub fn open(groups: u32) -> std::io::Result<Self> {
        let mut socket = netlink_sys::Socket::new(NETLINK_NETFILTER)?;
        socket.bind(&netlink_sys::SocketAddr::new(0, groups))?;
        socket.connect(&netlink_sys::SocketAddr::new(0, 0))?;
        Ok(ConntrackSocket { socket, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Blocks for the next multicast event and classifies it by the
    /// conntrack message type embedded in the netlink header.
    pub fn recv_event(&self) -> Result<ConntrackEvent, KernelError> {
        let mut buf = vec![0u8; 32 * 1024];
        let n = self
            .socket
            .recv(&mut buf, 0)
            .map_err(KernelError::from_raw_os_error)?;
        decode_multicast_message(&buf[..n])
    }

    /// Issues a full-table dump for `family` and collects every entry
    /// until `NLMSG_DONE`.
    pub fn dump(&mut self, family: u8) -> Result<Vec<ConntrackEvent>, KernelError> {
        let seq = self.next_seq();
        let request = build_dump_request(family, seq, 0);
        self.socket
            .send(&request, 0)
            .map_err(KernelError::from_raw_os_error)?;

        let mut entries = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = self
                .socket
                .recv(&mut buf, 0)
                .map_err(KernelError::from_raw_os_error)?;
            if n < NLMSG_HDRLEN {
                return Err(KernelError::MalformedConntrack("short dump reply".to_string()));
            }
            let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
            if msg_type == NLMSG_DONE {
                break;
            }
            if msg_type == NLMSG_ERROR {
                return Err(KernelError::MalformedConntrack("netlink error reply".to_string()));
            }
            entries.push(decode_event(ConntrackEventKind::New, &buf[..n])?);
        }
        Ok(entries)
    }

    /// Clones the live entry at `ctid` with a folded mark
    /// (spec.md §4.1 `rewrite_conntrack_mark`).
    pub fn rewrite_mark(&mut self, ctid: u32, new_mark: u32) -> Result<(), KernelError> {
        let seq = self.next_seq();
        let request = build_mark_rewrite_request(ctid, new_mark, seq, 0);
        self.socket
            .send(&request, 0)
            .map_err(KernelError::from_raw_os_error)?;
        Ok(())
    }
}

fn decode_multicast_message(data: &[u8]) -> Result<ConntrackEvent, KernelError> {
    if data.len() < NLMSG_HDRLEN {
        return Err(KernelError::MalformedConntrack("short multicast message".to_string()));
    }
    let msg_type = u16::from_ne_bytes([data[4], data[5]]);
    let ct_msg_type = (msg_type & 0xFF) as u8;
    let kind = match ct_msg_type {
        IPCTNL_MSG_CT_NEW => ConntrackEventKind::New,
        IPCTNL_MSG_CT_DELETE => ConntrackEventKind::Destroy,
        _ => ConntrackEventKind::Update,
    };
    decode_event(kind, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_tuple_ip_v4(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        push_nla(&mut buf, CTA_IP_V4_SRC, &src);
        push_nla(&mut buf, CTA_IP_V4_DST, &dst);
        buf
    }

    fn encode_tuple_proto(proto: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        push_nla(&mut buf, CTA_PROTO_NUM, &[proto]);
        push_nla(&mut buf, CTA_PROTO_SRC_PORT, &src_port.to_be_bytes());
        push_nla(&mut buf, CTA_PROTO_DST_PORT, &dst_port.to_be_bytes());
        buf
    }

    fn encode_full_message(ctid: u32) -> Vec<u8> {
        let ip = encode_tuple_ip_v4([10, 0, 0, 1], [203, 0, 113, 10]);
        let proto = encode_tuple_proto(6, 51000, 443);

        let mut tuple_attr = Vec::new();
        push_nla(&mut tuple_attr, CTA_TUPLE_IP, &ip);
        push_nla(&mut tuple_attr, CTA_TUPLE_PROTO, &proto);

        let mut attrs = Vec::new();
        push_nla(&mut attrs, CTA_TUPLE_ORIG, &tuple_attr);
        push_nla(&mut attrs, CTA_ID, &ctid.to_be_bytes());

        let mut msg = vec![0u8; NLMSG_HDRLEN + NFGENMSG_LEN];
        msg.extend_from_slice(&attrs);
        msg
    }

    #[test]
    fn decodes_ctid_and_tuple_from_new_event() {
        let msg = encode_full_message(4242);
        let event = decode_event(ConntrackEventKind::New, &msg).unwrap();
        assert_eq!(event.ctid, Some(4242));
        let tuple = event.tuple.unwrap();
        assert_eq!(tuple.server_port, 443);
        assert_eq!(tuple.client_port, 51000);
        assert_eq!(tuple.protocol, Protocol::Tcp);
    }

    #[test]
    fn rejects_truncated_message() {
        let err = decode_event(ConntrackEventKind::Destroy, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, KernelError::MalformedConntrack(_)));
    }

    #[test]
    fn dump_request_has_correct_length_prefix() {
        let req = build_dump_request(libc::AF_INET as u8, 1, 100);
        let declared_len = u32::from_ne_bytes([req[0], req[1], req[2], req[3]]) as usize;
        assert_eq!(declared_len, req.len());
    }

    #[test]
    fn mark_rewrite_request_carries_ctid_and_mark() {
        let req = build_mark_rewrite_request(7, 0xAB, 2, 200);
        assert!(req.len() > NLMSG_HDRLEN + NFGENMSG_LEN);
    }
}
