//! `threat` plugin (SPEC_FULL.md §2.13, priority 100, "high" per
//! spec.md §4.3).
//!
//! Consults a reputation service over a pooled line-oriented JSON
//! connection (spec.md §6 reputation wire) and compares the returned
//! score against `threat_sensitivity`. Bound-checks the response array
//! before indexing it — the documented fix for the source's unchecked
//! `[0]` read (spec.md §9(a)).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use sentry_common::Verdict;

use crate::pipeline::{Plugin, PluginMessage, PluginOutcome};
use crate::session::Session;

pub const DEFAULT_THREAT_SENSITIVITY: u32 = 80;
const IO_DEADLINE: Duration = Duration::from_secs(10);

/// Packet-mark bit folded in when a flow is blocked on reputation; an
/// arbitrary bit distinct from other built-in plugins' marks so the
/// folded value stays diagnosable.
const BLOCKED_MARK_BIT: u32 = 0x1;

#[derive(Debug, Deserialize)]
struct ReputationRecord {
    reputation: i64,
}

/// One pooled TCP connection to the reputation service, redialed
/// lazily on first use or after a transport fault.
pub struct ReputationClient {
    host: String,
    port: u16,
    conn: AsyncMutex<Option<BufReader<TcpStream>>>,
}

impl ReputationClient {
    pub fn new(host: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new(ReputationClient {
            host: host.into(),
            port,
            conn: AsyncMutex::new(None),
        })
    }

    /// Sends one `ip/getinfo` request and returns the decoded record
    /// array, or `None` on any transport fault (treated as "no data,
    /// accept" by the caller).
    async fn query(&self, ip: IpAddr) -> Option<Vec<ReputationRecord>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await.ok()?;
            *guard = Some(BufReader::new(stream));
        }

        let request = format!("{{\"ip/getinfo\":{{\"ips\":[\"{ip}\"]}}}}\n");
        let result = send_and_read(guard.as_mut().unwrap(), &request).await;
        if result.is_none() {
            *guard = None; // connection is suspect; redial next time
        }
        result
    }
}

async fn send_and_read(conn: &mut BufReader<TcpStream>, request: &str) -> Option<Vec<ReputationRecord>> {
    tokio::time::timeout(IO_DEADLINE, conn.get_mut().write_all(request.as_bytes()))
        .await
        .ok()?
        .ok()?;

    let mut line = String::new();
    let n = tokio::time::timeout(IO_DEADLINE, conn.read_line(&mut line)).await.ok()?.ok()?;
    if n == 0 {
        return None;
    }
    serde_json::from_str(line.trim()).ok()
}

pub struct ThreatPlugin {
    client: Arc<ReputationClient>,
    sensitivity: u32,
}

impl ThreatPlugin {
    pub fn new(client: Arc<ReputationClient>, sensitivity: u32) -> Self {
        ThreatPlugin { client, sensitivity }
    }
}

#[async_trait]
impl Plugin for ThreatPlugin {
    fn name(&self) -> &str {
        "threat"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn handle(&self, session: &Arc<Session>, message: &PluginMessage, _new_session: bool) -> PluginOutcome {
        let destination = message.tuple.server_addr;
        if is_private(destination) {
            return PluginOutcome {
                session_release: true,
                ..PluginOutcome::default()
            };
        }

        let records = self.client.query(destination).await;
        let Some(records) = records else {
            return PluginOutcome {
                session_release: true,
                ..PluginOutcome::default()
            };
        };

        // Bound-checked: an empty response means "no data, accept"
        // rather than indexing past the end (spec.md §9(a)).
        let Some(record) = records.first() else {
            return PluginOutcome {
                session_release: true,
                ..PluginOutcome::default()
            };
        };

        if record.reputation >= 0 && (record.reputation as u32) < self.sensitivity {
            session.set_attribute("blocked", "true");
            PluginOutcome {
                packet_mark: BLOCKED_MARK_BIT,
                session_release: true,
                verdict: Verdict::Drop,
            }
        } else {
            PluginOutcome {
                session_release: true,
                ..PluginOutcome::default()
            }
        }
    }
}

/// RFC 1918 / RFC 4193 / loopback / link-local ranges exempt from
/// reputation checks.
fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rfc1918_and_loopback_are_private() {
        assert!(is_private(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_private(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(is_private(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
    }

    #[test]
    fn public_address_is_not_private() {
        assert!(!is_private(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))));
    }

    #[test]
    fn bound_check_rejects_index_into_empty_response() {
        let records: Vec<ReputationRecord> = Vec::new();
        assert!(records.first().is_none());
    }

    #[test]
    fn low_score_below_sensitivity_is_flagged() {
        let record = ReputationRecord { reputation: 10 };
        let sensitivity = DEFAULT_THREAT_SENSITIVITY;
        assert!(record.reputation >= 0 && (record.reputation as u32) < sensitivity);
    }

    #[test]
    fn high_score_above_sensitivity_is_not_flagged() {
        let record = ReputationRecord { reputation: 95 };
        let sensitivity = DEFAULT_THREAT_SENSITIVITY;
        assert!(!(record.reputation >= 0 && (record.reputation as u32) < sensitivity));
    }
}
