//! `geoip` plugin (SPEC_FULL.md §2.13, priority 5).
//!
//! Looks up the server address against an in-memory CIDR table loaded
//! from a settings-provided path. A missing or empty table is a
//! configuration fault per spec.md §7 ("logged with a warn, safe
//! defaults used") — the plugin degrades to a no-op rather than
//! blocking the pipeline on a file it can't find.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::{Plugin, PluginMessage, PluginOutcome};
use crate::session::Session;

#[derive(Debug, Clone)]
struct CidrEntry {
    network: IpAddr,
    prefix_len: u8,
    country: String,
}

pub struct GeoIpPlugin {
    table: Vec<CidrEntry>,
}

impl GeoIpPlugin {
    /// Loads `path`'s CIDR table (`<cidr>,<country>` lines, `#`-prefixed
    /// comments ignored). A missing file yields an empty, no-op table
    /// with a warning rather than failing plugin registration.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                log::warn!("geoip table {} unavailable ({err}); running as no-op", path.display());
                return GeoIpPlugin { table: Vec::new() };
            }
        };
        GeoIpPlugin {
            table: parse_table(&contents),
        }
    }

    pub fn empty() -> Self {
        GeoIpPlugin { table: Vec::new() }
    }

    fn lookup(&self, addr: IpAddr) -> Option<&str> {
        self.table
            .iter()
            .find(|entry| cidr_contains(entry.network, entry.prefix_len, addr))
            .map(|entry| entry.country.as_str())
    }
}

fn parse_table(contents: &str) -> Vec<CidrEntry> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (cidr, country) = line.split_once(',')?;
            let (network, prefix_len) = cidr.split_once('/')?;
            Some(CidrEntry {
                network: network.trim().parse().ok()?,
                prefix_len: prefix_len.trim().parse().ok()?,
                country: country.trim().to_string(),
            })
        })
        .collect()
}

fn cidr_contains(network: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = mask_for(prefix_len.min(32), 32);
            u32::from(net) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = mask_for_128(prefix_len.min(128));
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

fn mask_for(prefix_len: u8, width: u32) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (width - prefix_len as u32)
    }
}

fn mask_for_128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

#[async_trait]
impl Plugin for GeoIpPlugin {
    fn name(&self) -> &str {
        "geoip"
    }

    fn priority(&self) -> i32 {
        5
    }

    async fn handle(&self, session: &Arc<Session>, message: &PluginMessage, _new_session: bool) -> PluginOutcome {
        if let Some(country) = self.lookup(message.tuple.server_addr) {
            session.set_attribute("geoip_country", country);
        }
        PluginOutcome {
            session_release: true,
            ..PluginOutcome::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn matches_containing_cidr_block() {
        let table = parse_table("203.0.113.0/24,US\n198.51.100.0/24,DE\n");
        let plugin = GeoIpPlugin { table };
        assert_eq!(
            plugin.lookup(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))),
            Some("US")
        );
        assert_eq!(
            plugin.lookup(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))),
            Some("DE")
        );
    }

    #[test]
    fn non_matching_address_yields_none() {
        let table = parse_table("203.0.113.0/24,US\n");
        let plugin = GeoIpPlugin { table };
        assert_eq!(plugin.lookup(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))), None);
    }

    #[test]
    fn empty_table_is_a_pure_noop() {
        let plugin = GeoIpPlugin::empty();
        assert_eq!(plugin.lookup(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))), None);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let table = parse_table("# comment\n\n203.0.113.0/24,US\n");
        assert_eq!(table.len(), 1);
    }
}
