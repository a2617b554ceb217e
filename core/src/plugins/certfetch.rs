//! `certfetch` plugin (SPEC_FULL.md §2.13, priority 2).
//!
//! Recognizes a TLS-looking session (server port 443, or a TLS
//! ClientHello record sniffed from the first packet) and kicks off a
//! certificate-cache fetch in the background. The handler itself
//! returns immediately with `session_release: true` — spec.md §4.3's
//! handler contract forbids blocking the dispatch thread on network
//! I/O — and the spawned task attaches the certificate's attributes to
//! the session directly once the single-flight fetch resolves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::certcache::{CertFetchOutcome, CertificateCache};
use crate::pipeline::{Plugin, PluginMessage, PluginOutcome};
use crate::session::Session;
use crate::tls;

const TLS_PORT: u16 = 443;
const DIAL_DEADLINE: Duration = Duration::from_secs(10);

pub struct CertFetchPlugin {
    cache: Arc<CertificateCache>,
}

impl CertFetchPlugin {
    pub fn new(cache: Arc<CertificateCache>) -> Self {
        CertFetchPlugin { cache }
    }
}

#[async_trait]
impl Plugin for CertFetchPlugin {
    fn name(&self) -> &str {
        "certfetch"
    }

    fn priority(&self) -> i32 {
        2
    }

    async fn handle(&self, session: &Arc<Session>, message: &PluginMessage, _new_session: bool) -> PluginOutcome {
        if looks_like_tls(message) {
            let cache = self.cache.clone();
            let session = session.clone();
            let key = message.tuple.server_endpoint_key();
            tokio::spawn(async move {
                let holder = cache.get_or_fetch(&key, dial_and_capture).await;
                if let CertFetchOutcome::Available(data) = holder.wait_ready().await {
                    CertificateCache::attach_to_session(&session, &data);
                }
            });
        }
        PluginOutcome {
            session_release: true,
            ..PluginOutcome::default()
        }
    }
}

async fn dial_and_capture(endpoint: String) -> CertFetchOutcome {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return CertFetchOutcome::Unavailable;
    };
    let Ok(port) = port.parse::<u16>() else {
        return CertFetchOutcome::Unavailable;
    };
    match tls::dial(host, port, DIAL_DEADLINE).await {
        Ok(stream) => match tls::capture_peer_certificate(&stream) {
            Ok(data) => CertFetchOutcome::Available(data),
            Err(_) => CertFetchOutcome::Unavailable,
        },
        Err(_) => CertFetchOutcome::Unavailable,
    }
}

/// Port 443 is enough on its own; a sniffed ClientHello additionally
/// catches TLS on a non-standard port (spec.md §4.3 example list).
fn looks_like_tls(message: &PluginMessage) -> bool {
    message.tuple.server_port == TLS_PORT || sniff_client_hello(&message.payload)
}

fn sniff_client_hello(packet: &[u8]) -> bool {
    let Some(tcp_payload) = tcp_payload_of(packet) else {
        return false;
    };
    // TLS record header: content type 0x16 (handshake), version 0x03XX,
    // then a handshake header whose first byte is 0x01 (ClientHello).
    tcp_payload.len() >= 6
        && tcp_payload[0] == 0x16
        && tcp_payload[1] == 0x03
        && tcp_payload[5] == 0x01
}

fn tcp_payload_of(packet: &[u8]) -> Option<&[u8]> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => {
            if packet.len() < 20 {
                return None;
            }
            let ihl = (packet[0] & 0x0F) as usize * 4;
            if packet[9] != 6 || packet.len() < ihl + 20 {
                return None;
            }
            let data_offset = ((packet[ihl + 12] >> 4) as usize) * 4;
            packet.get(ihl + data_offset..)
        }
        6 => {
            if packet.len() < 60 || packet[6] != 6 {
                return None;
            }
            let data_offset = ((packet[40 + 12] >> 4) as usize) * 4;
            packet.get(40 + data_offset..)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_common::{FiveTuple, Protocol};
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple(server_port: u16) -> FiveTuple {
        FiveTuple {
            protocol: Protocol::Tcp,
            client_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 51000,
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port,
        }
    }

    #[test]
    fn port_443_is_tls_looking_without_sniffing_payload() {
        let message = PluginMessage {
            ctid: 1,
            tuple: tuple(443),
            payload: Arc::new(vec![]),
        };
        assert!(looks_like_tls(&message));
    }

    #[test]
    fn client_hello_on_nonstandard_port_is_detected() {
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6;
        let mut tcp = vec![0u8; 20];
        tcp[12] = 5 << 4; // data offset 20 bytes
        let record = vec![0x16, 0x03, 0x03, 0x00, 0x05, 0x01];

        let mut packet = ip;
        packet.extend_from_slice(&tcp);
        packet.extend_from_slice(&record);

        let message = PluginMessage {
            ctid: 1,
            tuple: tuple(8443),
            payload: Arc::new(packet),
        };
        assert!(looks_like_tls(&message));
    }

    #[test]
    fn plain_http_port_is_not_tls_looking() {
        let message = PluginMessage {
            ctid: 1,
            tuple: tuple(80),
            payload: Arc::new(vec![0u8; 20]),
        };
        assert!(!looks_like_tls(&message));
    }
}
