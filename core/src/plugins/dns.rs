//! `dns` plugin (SPEC_FULL.md §2.13, priority 1).
//!
//! Passive: looks at the first packet only, and only when one side of the
//! flow is port 53. Attaches the query name from the payload's DNS
//! question section and releases unconditionally — a flow that isn't DNS
//! gets exactly one free look before this subscriber steps aside.

use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::{Plugin, PluginMessage, PluginOutcome};
use crate::session::Session;

const DNS_PORT: u16 = 53;

pub struct DnsPlugin;

#[async_trait]
impl Plugin for DnsPlugin {
    fn name(&self) -> &str {
        "dns"
    }

    fn priority(&self) -> i32 {
        1
    }

    async fn handle(&self, session: &Arc<Session>, message: &PluginMessage, _new_session: bool) -> PluginOutcome {
        if message.tuple.client_port == DNS_PORT || message.tuple.server_port == DNS_PORT {
            if let Some(name) = extract_query_name(&message.payload) {
                session.set_attribute("dns_query_name", &name);
            }
        }
        PluginOutcome {
            session_release: true,
            ..PluginOutcome::default()
        }
    }
}

/// Finds the UDP payload inside a raw IP packet and decodes the first
/// DNS question name out of it. Returns `None` rather than erroring on
/// anything short or malformed — a best-effort passive read.
fn extract_query_name(packet: &[u8]) -> Option<String> {
    let udp_payload = udp_payload_of(packet)?;
    decode_dns_question_name(udp_payload)
}

fn udp_payload_of(packet: &[u8]) -> Option<&[u8]> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => {
            if packet.len() < 20 {
                return None;
            }
            let ihl = (packet[0] & 0x0F) as usize * 4;
            if packet[9] != 17 || packet.len() < ihl + 8 {
                return None; // not UDP, or too short for a UDP header
            }
            Some(&packet[ihl + 8..])
        }
        6 => {
            if packet.len() < 40 || packet[6] != 17 || packet.len() < 48 {
                return None;
            }
            Some(&packet[48..])
        }
        _ => None,
    }
}

/// DNS header is 12 bytes; the question section starts with a sequence
/// of length-prefixed labels terminated by a zero-length label.
fn decode_dns_question_name(message: &[u8]) -> Option<String> {
    if message.len() <= 12 {
        return None;
    }
    let mut cursor = 12usize;
    let mut labels = Vec::new();
    loop {
        let len = *message.get(cursor)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            return None; // compression pointer; not expected in a question section
        }
        cursor += 1;
        let label = message.get(cursor..cursor + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        cursor += len;
        if labels.len() > 32 {
            return None; // pathological input, bail rather than loop forever
        }
    }
    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_query_packet(name_labels: &[&str]) -> Vec<u8> {
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = 17; // UDP
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[8, 8, 8, 8]);

        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&51000u16.to_be_bytes());
        udp[2..4].copy_from_slice(&DNS_PORT.to_be_bytes());

        let mut dns = vec![0u8; 12];
        for label in name_labels {
            dns.push(label.len() as u8);
            dns.extend_from_slice(label.as_bytes());
        }
        dns.push(0);

        let mut packet = ip;
        packet.extend_from_slice(&udp);
        packet.extend_from_slice(&dns);
        packet
    }

    #[test]
    fn extracts_dotted_name_from_question_section() {
        let packet = dns_query_packet(&["example", "com"]);
        assert_eq!(extract_query_name(&packet).as_deref(), Some("example.com"));
    }

    #[test]
    fn non_udp_packet_yields_none() {
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6; // TCP
        assert_eq!(extract_query_name(&ip), None);
    }

    #[test]
    fn truncated_label_length_does_not_panic() {
        let mut packet = dns_query_packet(&["a"]);
        packet.truncate(packet.len() - 1);
        assert_eq!(extract_query_name(&packet), None);
    }
}
