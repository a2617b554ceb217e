//! Five-tuple, protocol, and verdict vocabulary shared by the kernel
//! adapter, session table, and dispatch pipeline.

use std::net::IpAddr;

/// L4 protocol carried by a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl Protocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::Icmpv6,
            other => Self::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmpv6 => 58,
            Self::Other(n) => *n,
        }
    }
}

/// Identifies a tracked flow by its client/server endpoints.
///
/// Ports are always formatted in decimal (spec mandate, §9(b) of the design
/// notes — the source occasionally formatted a port from a raw byte value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub client_addr: IpAddr,
    pub client_port: u16,
    pub server_addr: IpAddr,
    pub server_port: u16,
}

impl FiveTuple {
    pub fn server_endpoint_key(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

/// Verdict returned to the kernel for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Repeat,
}

impl Verdict {
    /// Raw NFQUEUE verdict constant.
    pub fn as_nfq_verdict(self) -> u32 {
        match self {
            Verdict::Accept => 1, // NF_ACCEPT
            Verdict::Drop => 0,   // NF_DROP
            Verdict::Repeat => 4, // NF_REPEAT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn protocol_round_trips_known_numbers() {
        for n in [1u8, 6, 17, 58] {
            assert_eq!(Protocol::from_number(n).number(), n);
        }
        assert_eq!(Protocol::from_number(200).number(), 200);
    }

    #[test]
    fn server_endpoint_key_is_decimal() {
        let tuple = FiveTuple {
            protocol: Protocol::Tcp,
            client_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 51000,
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port: 443,
        };
        assert_eq!(tuple.server_endpoint_key(), "203.0.113.10:443");
    }
}
