//! Network admission filter.
//!
//! Connections are accepted or refused by source address before any
//! session state exists. An empty range list admits everyone.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use cidr::{IpCidr, IpInet};
use tracing::{debug, error, warn};

/// Immutable set of allowed address ranges.
#[derive(Debug, Clone, Default)]
pub struct AdmissionFilter {
    ranges: Vec<IpCidr>,
    dropped: usize,
}

impl AdmissionFilter {
    /// A filter that admits every peer.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build a filter from range strings such as `10.0.0.0/8` or `::1/128`.
    ///
    /// Host bits are ignored (`192.168.1.7/24` means `192.168.1.0/24`) and a
    /// bare address is a single-host range. Malformed entries are dropped
    /// with a warning. When every entry is malformed the filter is left
    /// open and the condition is logged as an error.
    pub fn from_ranges<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranges = Vec::new();
        let mut dropped = 0;
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match parse_range(entry) {
                Some(range) => ranges.push(range),
                None => {
                    warn!(range = entry, "Ignoring malformed network range");
                    dropped += 1;
                }
            }
        }
        if ranges.is_empty() && dropped > 0 {
            error!(
                dropped,
                "No valid entries in allowed networks, accepting connections from any address"
            );
        }
        Self { ranges, dropped }
    }

    /// Whether a peer (`host` or `host:port`) may open a session.
    ///
    /// Unparseable peer addresses are refused once any range is configured.
    pub fn is_allowed(&self, remote: &str) -> bool {
        if self.ranges.is_empty() {
            return true;
        }

        let Some(ip) = peer_ip(remote) else {
            warn!(peer = remote, "Refusing connection from unparseable address");
            return false;
        };

        let allowed = self.ranges.iter().any(|range| range.contains(&ip));
        if !allowed {
            debug!(peer = remote, "Peer outside all allowed networks");
        }
        allowed
    }

    /// Number of configured entries that failed to parse.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Ranges were configured but none survived parsing.
    pub fn is_open_by_misconfiguration(&self) -> bool {
        self.ranges.is_empty() && self.dropped > 0
    }

    pub fn ranges(&self) -> &[IpCidr] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_range(entry: &str) -> Option<IpCidr> {
    if entry.contains('/') {
        IpInet::from_str(entry).ok().map(|inet| inet.network())
    } else {
        IpAddr::from_str(entry).ok().map(IpCidr::new_host)
    }
}

/// Extract the host address from `ip`, `ip:port` or `[ipv6]:port`.
fn peer_ip(remote: &str) -> Option<IpAddr> {
    let remote = remote.trim();
    let ip = match SocketAddr::from_str(remote) {
        Ok(addr) => addr.ip(),
        Err(_) => {
            let host = remote
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(remote);
            IpAddr::from_str(host).ok()?
        }
    };
    // `::ffff:10.0.0.1` is matched against IPv4 ranges.
    Some(ip.to_canonical())
}
